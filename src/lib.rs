//! genia-relay - multi-provider streaming chat relay with ordered fallback
//!
//! This library provides the core functionality for the relay server,
//! including configuration, provider adapters, the fallback cascade and
//! the learner evaluation endpoint.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod providers;
pub mod relay;

pub use config::Config;
pub use error::Error;
