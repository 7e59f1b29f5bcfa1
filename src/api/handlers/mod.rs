//! Route handlers, grouped by surface

pub mod admin;
pub mod health;
pub mod webhooks;
