pub mod bundle_handlers;
pub mod health_handlers;
pub mod object_handlers;
pub mod rule_handlers;
