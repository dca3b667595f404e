//! Repositories for dubflow.

pub mod state;

pub use state::{SqlxStateStore, StateStore};
