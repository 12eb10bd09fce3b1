// src/errors.rs

//! Crate-wide error aliases.
//!
//! Most of the crate propagates `anyhow` errors with context; the typed
//! configuration errors live in `config::model`.

pub use anyhow::{Error, Result};
