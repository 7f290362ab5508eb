//! Configuration Vault – reads/writes `~/.posefuse/config.toml`.
//!
//! The file holds a [`FusionConfig`]; a handful of scalar fields can be
//! overridden from the environment without editing it.

use posefuse_perception::StrategyKind;
use posefuse_runtime::FusionConfig;
use serde::Deserialize;
use serde::de::IntoDeserializer;
use std::fs;
use std::path::{Path, PathBuf};

/// Return the path to `~/.posefuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".posefuse").join("config.toml")
}

/// Resolve the configuration for this run.
///
/// An explicit path must exist. Without one, `~/.posefuse/config.toml` is
/// used when present and the built-in defaults otherwise. Environment
/// overrides are applied in every case.
pub fn resolve(explicit: Option<&Path>) -> Result<(FusionConfig, Option<PathBuf>), String> {
    match explicit {
        Some(path) => match load_from(path)? {
            Some(cfg) => Ok((cfg, Some(path.to_path_buf()))),
            None => Err(format!("Config file {} does not exist", path.display())),
        },
        None => {
            let path = config_path();
            match load_from(&path)? {
                Some(cfg) => Ok((cfg, Some(path))),
                None => {
                    let mut cfg = FusionConfig::default();
                    apply_env_overrides(&mut cfg);
                    Ok((cfg, None))
                }
            }
        }
    }
}

/// Load the config from a specific path. Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<FusionConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: FusionConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `POSEFUSE_*` environment variable overrides to `cfg`.
///
/// Unparseable values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `POSEFUSE_STRATEGY` | `filter.strategy` (`kalman`, `average`, `weighted-average`, `median`, `trend-line`) |
/// | `POSEFUSE_ENABLE_TAGS` | `sources.enable_tags` |
/// | `POSEFUSE_ENABLE_ODOM` | `sources.enable_odom` |
/// | `POSEFUSE_ENABLE_IMU` | `sources.enable_imu` |
/// | `POSEFUSE_TAG_CONFIDENCE_THRESHOLD` | `gating.tag_confidence_threshold` |
/// | `POSEFUSE_IDLE_PREDICT` | `scheduler.idle_predict` |
/// | `POSEFUSE_QUEUE_CAPACITY` | `scheduler.queue_capacity` |
pub fn apply_env_overrides(cfg: &mut FusionConfig) {
    if let Ok(v) = std::env::var("POSEFUSE_STRATEGY")
        && let Ok(kind) = parse_strategy(&v)
    {
        cfg.filter.strategy = kind;
    }
    if let Ok(v) = std::env::var("POSEFUSE_ENABLE_TAGS")
        && let Ok(b) = v.parse::<bool>()
    {
        cfg.sources.enable_tags = b;
    }
    if let Ok(v) = std::env::var("POSEFUSE_ENABLE_ODOM")
        && let Ok(b) = v.parse::<bool>()
    {
        cfg.sources.enable_odom = b;
    }
    if let Ok(v) = std::env::var("POSEFUSE_ENABLE_IMU")
        && let Ok(b) = v.parse::<bool>()
    {
        cfg.sources.enable_imu = b;
    }
    if let Ok(v) = std::env::var("POSEFUSE_TAG_CONFIDENCE_THRESHOLD")
        && let Ok(t) = v.parse::<f64>()
    {
        cfg.gating.tag_confidence_threshold = t;
    }
    if let Ok(v) = std::env::var("POSEFUSE_IDLE_PREDICT")
        && let Ok(b) = v.parse::<bool>()
    {
        cfg.scheduler.idle_predict = b;
    }
    if let Ok(v) = std::env::var("POSEFUSE_QUEUE_CAPACITY")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.scheduler.queue_capacity = n;
    }
}

fn parse_strategy(value: &str) -> Result<StrategyKind, serde::de::value::Error> {
    StrategyKind::deserialize(value.trim().into_deserializer())
}

/// Save the config to a specific path, creating parent directories.
pub(crate) fn save_to(cfg: &FusionConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_points_to_posefuse_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".posefuse"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = FusionConfig::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.filter.initial_covariance, cfg.filter.initial_covariance);
        assert_eq!(loaded.filter.state_transition_matrix, cfg.filter.state_transition_matrix);
        assert_eq!(loaded.cameras, cfg.cameras);
        assert_eq!(loaded.sensors, cfg.sensors);
        loaded.validate().expect("valid");
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let missing = dir.path().join("nope.toml");
        assert!(resolve(Some(&missing)).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[filter\nstrategy = ").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robot.toml");
        fs::write(&path, "[sources]\nenable_odom = true\n").expect("write");
        let (cfg, used) = resolve(Some(&path)).expect("resolve");
        assert!(cfg.sources.enable_odom);
        assert_eq!(used.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!(parse_strategy("median").unwrap(), StrategyKind::Median);
        assert_eq!(parse_strategy("trend-line").unwrap(), StrategyKind::TrendLine);
        assert!(parse_strategy("bogus").is_err());
    }

    #[test]
    fn apply_env_overrides_changes_strategy() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POSEFUSE_STRATEGY", "weighted-average") };
        let mut cfg = FusionConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.filter.strategy, StrategyKind::WeightedAverage);
        unsafe { std::env::remove_var("POSEFUSE_STRATEGY") };
    }

    #[test]
    fn apply_env_overrides_toggles_sources() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POSEFUSE_ENABLE_IMU", "true") };
        let mut cfg = FusionConfig::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.sources.enable_imu);
        unsafe { std::env::remove_var("POSEFUSE_ENABLE_IMU") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_capacity() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POSEFUSE_QUEUE_CAPACITY", "lots") };
        let mut cfg = FusionConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.scheduler.queue_capacity, 256);
        unsafe { std::env::remove_var("POSEFUSE_QUEUE_CAPACITY") };
    }

    #[test]
    fn apply_env_overrides_changes_threshold() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("POSEFUSE_TAG_CONFIDENCE_THRESHOLD", "40.5") };
        let mut cfg = FusionConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.gating.tag_confidence_threshold, 40.5);
        unsafe { std::env::remove_var("POSEFUSE_TAG_CONFIDENCE_THRESHOLD") };
    }
}
