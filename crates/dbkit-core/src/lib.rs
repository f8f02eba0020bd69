//! # dbkit-core
//!
//! Core library for dbkit providing:
//! - Configuration loading (embedded defaults, `config.yaml`, `DBKIT_*` env)
//! - Application paths resolved from XDG-style homes
//! - Collaborator interfaces: [`driver::Connection`], [`driver::ConnectionProvider`]
//!   and [`driver::Dialect`], plus a MySQL reference dialect

pub mod config;
pub mod driver;
pub mod error;
pub mod types;
pub mod utils;

pub use config::{ConfigLoader, Paths};
pub use error::{Error, Result};
pub use types::DbkitConfig;
pub use utils::truncate_for_display;
