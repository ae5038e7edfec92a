pub mod bundle_repo;
pub mod bundle_service;
pub mod bundler;
pub mod bundler_accounts;
pub mod chain;
pub mod object_repo;
pub mod packer;
pub mod retry;
pub mod rule_store;
pub mod staging;
