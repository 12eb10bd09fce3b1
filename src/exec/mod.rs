// src/exec/mod.rs

//! Pipeline execution and managed-process supervision.

mod runner;

pub use runner::{
    ExitInfo, ExitSlot, NullObserver, OutputSink, Runner, RunnerObserver,
};
