pub mod cli;
pub mod config;
pub mod exporter;
pub mod ir;
pub mod loader;
pub mod model;
pub mod optimizer;
pub mod tracer;
pub mod verifier;
