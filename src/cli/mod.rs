//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Listing catalog models and resolving their manifests
//! - Pulling, verifying and evicting cached weights
//! - Probing GPU support

pub mod commands;
pub mod handlers;

pub use handlers::{handle_command, init_logging};
