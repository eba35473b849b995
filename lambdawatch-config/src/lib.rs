//! Configuration models and loading for lambdawatch.
//!
//! [`AppConfig`] wraps the core's [`lambdawatch_core::SessionConfig`] with
//! the settings only the operator binary needs. [`ConfigLoader`] resolves it
//! from an explicit file, the environment, a file in a default location, or
//! the built-in defaults, in that order.

#![allow(missing_docs)]

pub mod loader;
pub mod models;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigSource, EnvOverrides,
};
pub use models::{AppConfig, ProcessorConfig};
