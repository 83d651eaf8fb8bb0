//! Optional `config.toml` in the state directory.
//!
//! Every section and field is defaulted, so an absent file, an empty file and
//! a partial file all load. CLI flags override what is read here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::agent::LlmProvider;
use crate::modules::qi::Qi;
use crate::modules::wallet::{DEFAULT_DIFFICULTY_BITS, DEFAULT_MINING_REWARD, MineParams};
use crate::modules::world::WorldRules;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ticks per second when neither a rate nor a delay is configured.
pub const DEFAULT_TICK_RATE: f64 = 1.0;

/// Sleep between ticks. A rate wins over a delay; a zero delay means the
/// default rate.
pub fn pacing(tick_rate: Option<f64>, delay_ms: u64) -> Result<Duration, ConfigError> {
    match tick_rate {
        Some(rate) => {
            check_tick_rate(rate)?;
            Duration::try_from_secs_f64(rate.recip()).map_err(|e| ConfigError::Invalid {
                field: "tick_rate",
                reason: e.to_string(),
            })
        }
        None if delay_ms > 0 => Ok(Duration::from_millis(delay_ms)),
        None => Ok(Duration::from_secs_f64(DEFAULT_TICK_RATE.recip())),
    }
}

fn check_tick_rate(rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: "tick_rate",
            reason: format!("{} is not a positive finite number", rate),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Rules copied into a freshly initialised world.
    #[serde(default)]
    pub world: WorldRules,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl SimConfig {
    /// Load `path`, or defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(rate) = config.engine.tick_rate {
            check_tick_rate(rate)?;
        }
        Ok(config)
    }
}

fn default_difficulty_bits() -> u32 {
    DEFAULT_DIFFICULTY_BITS
}
fn default_reward() -> Qi {
    DEFAULT_MINING_REWARD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_difficulty_bits")]
    pub difficulty_bits: u32,
    #[serde(default = "default_reward")]
    pub reward: Qi,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty_bits: default_difficulty_bits(),
            reward: default_reward(),
        }
    }
}

impl MiningConfig {
    pub fn params(&self, iterations: u64) -> MineParams {
        MineParams {
            iterations,
            difficulty_bits: self.difficulty_bits,
            reward: self.reward,
        }
    }
}

fn default_brain_timeout_ms() -> u64 {
    15_000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on one brain decision.
    #[serde(default = "default_brain_timeout_ms")]
    pub brain_timeout_ms: u64,
    /// Also write `world_snapshots/tick_NNNNNN.json` for every tick.
    #[serde(default = "default_true")]
    pub keep_snapshot_history: bool,
    /// Ticks per second for `harimu start` when no pacing flag is given.
    #[serde(default)]
    pub tick_rate: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            brain_timeout_ms: default_brain_timeout_ms(),
            keep_snapshot_history: true,
            tick_rate: None,
        }
    }
}

fn default_llm_host() -> String {
    "https://api.openai.com".to_string()
}
fn default_llm_model() -> String {
    "gpt-5-nano".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_host")]
    pub host: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            host: default_llm_host(),
            model: default_llm_model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SimConfig::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, SimConfig::default());
        assert_eq!(config.mining.difficulty_bits, 16);
        assert_eq!(config.world.max_move_radius, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "[world]\nscan_range = 4\n\n[mining]\nreward = 9\n\n[llm]\nprovider = \"ollama\"\n",
        )
        .unwrap();
        let config = SimConfig::load(&path).unwrap();
        assert_eq!(config.world.scan_range, 4);
        assert_eq!(config.world.half_extent, 256);
        assert_eq!(config.mining.reward, 9);
        assert_eq!(config.mining.difficulty_bits, 16);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert!(config.engine.keep_snapshot_history);
    }

    #[test]
    fn tick_rate_must_be_positive_and_finite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        for bad in ["0.0", "-2.0", "nan", "inf"] {
            fs::write(&path, format!("[engine]\ntick_rate = {}\n", bad)).unwrap();
            assert!(
                matches!(SimConfig::load(&path), Err(ConfigError::Invalid { field: "tick_rate", .. })),
                "{}",
                bad
            );
        }
        fs::write(&path, "[engine]\ntick_rate = 4.0\n").unwrap();
        assert_eq!(SimConfig::load(&path).unwrap().engine.tick_rate, Some(4.0));
    }

    #[test]
    fn pacing_prefers_tick_rate() {
        assert_eq!(pacing(Some(4.0), 10).unwrap(), Duration::from_millis(250));
        assert_eq!(pacing(None, 10).unwrap(), Duration::from_millis(10));
        assert_eq!(pacing(None, 0).unwrap(), Duration::from_secs(1));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::MIN_POSITIVE] {
            assert!(pacing(Some(bad), 0).is_err(), "{}", bad);
        }
    }

    #[test]
    fn bad_toml_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "[world\n").unwrap();
        assert!(matches!(SimConfig::load(&path), Err(ConfigError::Toml { .. })));
    }
}
