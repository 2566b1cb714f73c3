use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::RelayError;
use crate::protocol::types::AGENT;

/// Settings for one relay run. Every field has a default, so a JSON file only needs to name the
/// values it changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Bound on opening a session and reading its advertisement.
    #[serde(deserialize_with = "duration_or_secs", serialize_with = "as_millis_text")]
    pub connect_timeout: Duration,
    /// Bound on a single read or write making no progress.
    #[serde(deserialize_with = "duration_or_secs", serialize_with = "as_millis_text")]
    pub idle_timeout: Duration,
    /// Pack chunks buffered between the fetch and push sides.
    pub chunk_window: usize,
    /// Read size for packs that arrive without side-band framing.
    pub chunk_size: usize,
    pub git_binary: PathBuf,
    pub ssh_binary: PathBuf,
    /// Ref globs to mirror. `*` also matches `/`.
    pub include_refs: Vec<String>,
    /// Ref globs to leave alone; these win over `include_refs`.
    pub exclude_refs: Vec<String>,
    /// Delete target refs that no longer exist on the source.
    pub prune: bool,
    /// Ask for an all-or-nothing push when the target supports it.
    pub atomic: bool,
    pub dry_run: bool,
    pub agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            chunk_window: 16,
            chunk_size: 64 * 1024,
            git_binary: PathBuf::from("git"),
            ssh_binary: PathBuf::from("ssh"),
            include_refs: vec!["refs/*".to_string()],
            exclude_refs: Vec::new(),
            prune: true,
            atomic: true,
            dry_run: false,
            agent: AGENT.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        let config: RelayConfig =
            serde_json::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.chunk_window == 0 {
            return Err(RelayError::Config("chunk_window must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(RelayError::Config("chunk_size must be at least 1".into()));
        }
        if self.connect_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(RelayError::Config("timeouts must be positive".into()));
        }
        if self.include_refs.is_empty() {
            return Err(RelayError::Config("include_refs must not be empty".into()));
        }
        Ok(())
    }
}

/// Parses `"90"`, `"90s"`, `"500ms"`, `"2m"` or `"1h"`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit {other:?} in {text:?}")),
    }
}

fn duration_or_secs<'deserialize, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'deserialize>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU64 {
        String(String),
        U64(u64),
    }

    match StringOrU64::deserialize(deserializer)? {
        StringOrU64::String(v) => parse_duration(&v).map_err(serde::de::Error::custom),
        StringOrU64::U64(v) => Ok(Duration::from_secs(v)),
    }
}

fn as_millis_text<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{}ms", value.as_millis()))
}
