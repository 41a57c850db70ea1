//! Digest configuration.
//!
//! A small line-oriented format:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `ttl = <n>` | digest iteration ceiling (default 10) |
//! | `cache_expressions = true\|false` | memoize compiled expressions (default on) |
//! | Lines starting with `;` | comment, ignored |
//!
//! Bad lines are reported with their line number and skipped, so a partly
//! valid file still loads.

use std::path::Path;

/// Default digest iteration ceiling.
pub const DEFAULT_TTL: usize = 10;

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Settings shared by every scope of one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestConfig {
    /// A digest fails once this many passes have come out dirty.
    pub ttl: usize,
    /// Compile each distinct expression text once per tree.
    pub cache_expressions: bool,
}

impl Default for DigestConfig {
    fn default() -> Self {
        DigestConfig {
            ttl: DEFAULT_TTL,
            cache_expressions: true,
        }
    }
}

impl DigestConfig {
    /// Parse a config string, starting from the defaults.
    ///
    /// Returns the config and a list of any errors, one per rejected line.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = DigestConfig::default();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                errors.push(ConfigError {
                    line: lineno,
                    message: format!("expected `name = value`, got `{line}`"),
                });
                continue;
            };

            if let Err(message) = config.apply(key.trim(), value.trim()) {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "ttl" => {
                let ttl: usize = value
                    .parse()
                    .map_err(|_| format!("ttl: `{value}` is not a number"))?;
                if ttl == 0 {
                    return Err("ttl must be at least 1".into());
                }
                self.ttl = ttl;
            }
            "cache_expressions" => {
                self.cache_expressions = parse_bool(value)
                    .ok_or_else(|| format!("cache_expressions: `{value}` is not a boolean"))?;
            }
            other => return Err(format!("unknown setting `{other}`")),
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
