//! CLI commands

use std::fmt::Display;

use crate::{Error, Result};

pub mod deploy;
pub mod import;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
///
/// This reduces boilerplate for the common pattern of `.map_err(|e| Error::command_failed(e.to_string()))`.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Collect the names of required-but-empty settings into one validation error.
pub(crate) fn require(settings: &[(&str, Option<&str>)]) -> Result<()> {
    let missing: Vec<&str> = settings
        .iter()
        .filter(|(_, value)| value.map_or(true, |v| v.trim().is_empty()))
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "missing required settings: {}",
            missing.join(", ")
        )))
    }
}
