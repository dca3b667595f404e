//! dubflow library crate.
//!
//! Core of a multi-user media-dubbing service: the job scheduler, the
//! pipeline-runner contract, and the durable state store.

pub mod config;
pub mod database;
pub mod error;
pub mod scheduler;

pub use error::{Error, Result};
