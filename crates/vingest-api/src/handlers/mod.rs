//! HTTP handlers.

pub mod health;
pub mod renditions;
pub mod uploads;

pub use health::{health, ready};
