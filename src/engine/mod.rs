// src/engine/mod.rs

//! The per-target watch–build–supervise loop.

mod runtime;

pub use runtime::{run_target, Controls, EngineOptions};
