//! Host side of the WASI demo: runs the demo guests under wasmtime.

pub mod logger;
pub mod report;
pub mod runtime;
pub mod shutdown;
