//! Consumers of the tracer's public contracts: the terminal chart renderer,
//! the realtime monitor and the dump inspector CLI. No capture machinery
//! lives here.

pub mod charts;
pub mod monitor;
