//! Shared helpers
//!
//! Logging setup, timing and identifier generation.

pub mod logger;
pub mod timer;

pub use timer::Timer;

/// Generate a fresh opaque identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
