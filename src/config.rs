// ABOUTME: Configuration loading for voicegate.
// ABOUTME: Reads ~/.voicegate/config.toml and locates the persisted state files beside it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// No grant may outlive a day, whatever the config says.
pub const MAX_GRANT_SECONDS: u64 = 86_400;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity recorded as the actor for operator-initiated events.
    pub operator_id: String,
    pub grants: GrantsConfig,
    pub voice: VoiceConfig,
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator_id: "operator".to_string(),
            grants: GrantsConfig::default(),
            voice: VoiceConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Grant duration rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrantsConfig {
    /// Duration selected by code 0.
    pub default_seconds: u64,
    pub min_seconds: u64,
    pub max_seconds: u64,
    /// Duration of grants issued by a voice match alone.
    pub voice_grant_seconds: u64,
}

impl Default for GrantsConfig {
    fn default() -> Self {
        Self {
            default_seconds: 300,
            min_seconds: 60,
            max_seconds: 3600,
            voice_grant_seconds: 300,
        }
    }
}

/// Voice biometric settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// A sample matches iff cosine similarity >= 1 - tolerance.
    pub tolerance: f32,
    pub min_sample_ms: u64,
    pub min_rms: f32,
    pub require_voice_for_sudo: bool,
    pub require_voice_for_debug: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.35,
            min_sample_ms: 500,
            min_rms: 0.01,
            require_voice_for_sudo: false,
            require_voice_for_debug: false,
        }
    }
}

impl VoiceConfig {
    pub fn threshold(&self) -> f32 {
        (1.0 - self.tolerance).clamp(0.0, 1.0)
    }
}

/// Background expiry sweep settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl Config {
    /// Load config from `<dir>/config.toml`, falling back to defaults.
    pub fn load(paths: &StatePaths) -> anyhow::Result<Self> {
        let path = paths.config();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the grant invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        let g = &self.grants;
        if g.min_seconds == 0 || g.min_seconds > g.max_seconds {
            anyhow::bail!(
                "grants.min_seconds must be in 1..=max_seconds (got {} / {})",
                g.min_seconds,
                g.max_seconds
            );
        }
        if g.max_seconds > MAX_GRANT_SECONDS {
            anyhow::bail!("grants.max_seconds must be at most {MAX_GRANT_SECONDS}");
        }
        if g.default_seconds == 0 || g.voice_grant_seconds == 0 {
            anyhow::bail!("grant durations must be positive");
        }
        if g.default_seconds > MAX_GRANT_SECONDS || g.voice_grant_seconds > MAX_GRANT_SECONDS {
            anyhow::bail!("grant durations must be at most {MAX_GRANT_SECONDS}s");
        }
        if !(0.0..1.0).contains(&self.voice.tolerance) {
            anyhow::bail!("voice.tolerance must be in [0, 1)");
        }
        Ok(())
    }
}

/// Locations of the config file and persisted state.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::new(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".voicegate"),
        )
    }
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn keywords(&self) -> PathBuf {
        self.root.join("keywords.json")
    }

    pub fn voice_profiles(&self) -> PathBuf {
        self.root.join("voice_profiles.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn dangerous_patterns(&self) -> PathBuf {
        self.root.join("dangerous_patterns.json")
    }
}

/// Write `content` to `path` atomically via a sibling tmp file and rename.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.operator_id, "operator");
        assert_eq!(config.grants.default_seconds, 300);
        assert_eq!(config.grants.min_seconds, 60);
        assert_eq!(config.grants.max_seconds, 3600);
        assert_eq!(config.sweep.interval(), Duration::from_secs(5));
        assert!((config.voice.threshold() - 0.65).abs() < 1e-6);
    }

    #[test]
    fn parse_config_toml() {
        let toml_str = r#"
operator_id = "tony"

[grants]
default_seconds = 600
max_seconds = 7200

[voice]
tolerance = 0.2
require_voice_for_debug = true

[sweep]
interval_seconds = 2
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.operator_id, "tony");
        assert_eq!(config.grants.default_seconds, 600);
        assert_eq!(config.grants.min_seconds, 60);
        assert_eq!(config.grants.max_seconds, 7200);
        assert!(config.voice.require_voice_for_debug);
        assert!(!config.voice.require_voice_for_sudo);
        assert_eq!(config.sweep.interval_seconds, 2);
    }

    #[test]
    fn parse_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[voice]\nmin_rms = 0.05\n").unwrap();
        assert_eq!(config.operator_id, "operator");
        assert_eq!(config.grants.voice_grant_seconds, 300);
        assert!((config.voice.min_rms - 0.05).abs() < 1e-6);
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut config = Config::default();
        config.grants.min_seconds = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_from_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        assert_eq!(Config::load(&paths).unwrap().operator_id, "operator");

        std::fs::write(paths.config(), "operator_id = \"jarvis-owner\"\n").unwrap();
        assert_eq!(Config::load(&paths).unwrap().operator_id, "jarvis-owner");
    }

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, "{}").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
