//! Core data models for the bundle service.
//!
//! These entities map to the tables in `migrations/0001_init.sql` via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bundle;
pub mod bundle_rule;
pub mod bundler_account;
pub mod object;
