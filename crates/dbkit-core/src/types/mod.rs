//! Type definitions for dbkit configuration

mod runtime_config;

pub use runtime_config::*;
