//! Shared utility functions for dbkit crates

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Get the user's data home directory
///
/// Prefers `XDG_DATA_HOME` over `dirs::data_dir()` so that an explicitly
/// exported location wins on every platform, matching shell tooling.
pub fn get_data_home() -> Result<PathBuf> {
    if let Some(dir) = non_empty_env("XDG_DATA_HOME") {
        return Ok(PathBuf::from(dir));
    }

    dirs::data_dir().ok_or_else(|| Error::missing_directory("data"))
}

/// Get the user's config home directory
///
/// Same precedence as [`get_data_home`], using `XDG_CONFIG_HOME`.
pub fn get_config_home() -> Result<PathBuf> {
    if let Some(dir) = non_empty_env("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(dir));
    }

    dirs::config_dir().ok_or_else(|| Error::missing_directory("config"))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Truncate text for error reports and logs, appending an ellipsis when cut.
///
/// Cuts on a character boundary so the result is always valid UTF-8.
pub fn truncate_for_display(text: &str, max_chars: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_data_home_from_env() {
        std::env::set_var("XDG_DATA_HOME", "/tmp/dbkit-data");
        assert_eq!(get_data_home().unwrap(), PathBuf::from("/tmp/dbkit-data"));
        std::env::remove_var("XDG_DATA_HOME");
    }

    #[test]
    #[serial]
    fn test_config_home_ignores_blank_env() {
        std::env::set_var("XDG_CONFIG_HOME", "  ");
        if let Ok(home) = get_config_home() {
            assert_ne!(home, PathBuf::from("  "));
        }
        std::env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_truncate_for_display() {
        assert_eq!(truncate_for_display("SELECT 1", 20), "SELECT 1");
        assert_eq!(truncate_for_display("abcdef", 3), "abc...");
        assert_eq!(truncate_for_display("héllo", 2), "hé...");
    }
}
