//! Duracache Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, persistence configuration, and
//! capability traits used across all duracache crates.

pub mod cloner;
pub mod config;
pub mod error;

pub use cloner::Cloner;
pub use config::{DumpInterval, PersistConfig, RewriteInterval};
pub use error::{Error, Result};
