//! Configuration module for the gallery pack preprocessor
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
