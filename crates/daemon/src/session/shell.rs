//! Default shell arguments.
//!
//! When a caller asks for a shell without arguments, the arguments are
//! picked from the command's basename. The built-in table covers the common
//! shells and can be extended or overridden from `[session.shell_args]`.

use std::collections::BTreeMap;

/// Table key that replaces the fallback for unknown shells.
pub const FALLBACK_KEY: &str = "*";

/// Maps shell basenames to the arguments used when none are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellArgsPolicy {
    table: BTreeMap<String, Vec<String>>,
    fallback: Vec<String>,
}

impl Default for ShellArgsPolicy {
    fn default() -> Self {
        let interactive = vec!["-i".to_string()];
        let mut table = BTreeMap::new();
        for shell in ["fish", "bash", "zsh", "sh", "dash", "ksh"] {
            table.insert(shell.to_string(), interactive.clone());
        }
        for shell in ["pwsh", "powershell"] {
            table.insert(shell.to_string(), vec!["-NoLogo".to_string()]);
        }
        Self {
            table,
            fallback: interactive,
        }
    }
}

impl ShellArgsPolicy {
    /// The built-in table with `overrides` applied on top.
    ///
    /// Keys are matched like basenames. The key `*` replaces the fallback.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> Self {
        let mut policy = Self::default();
        for (shell, args) in overrides {
            if shell == FALLBACK_KEY {
                policy.fallback = args.clone();
            } else {
                policy.table.insert(shell_basename(shell), args.clone());
            }
        }
        policy
    }

    /// Arguments for `command` when the caller supplied none.
    pub fn args_for(&self, command: &str) -> Vec<String> {
        self.table
            .get(&shell_basename(command))
            .unwrap_or(&self.fallback)
            .clone()
    }
}

/// Lowercased file name of `command` without a trailing `.exe`.
pub fn shell_basename(command: &str) -> String {
    let trimmed = command.trim();
    let name = trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(trimmed);
    let lower = name.to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}
