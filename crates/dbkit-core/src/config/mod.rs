//! Configuration loading and application paths

mod loader;

pub use loader::{ConfigLoader, Paths, CONFIG_FILENAME};
