//! Ding server library.
//!
//! This library exposes the server components for use in integration tests.

pub mod routes;
pub mod service;
pub mod state;
pub mod worker;

pub use state::AppState;

pub use ding_core;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
