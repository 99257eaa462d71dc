//! Configuration vault – reads/writes `~/.spatialvcs/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use spatialvcs_memory::MemoryConfig;
use spatialvcs_perception::{DetectorConfig, FrameProcessorConfig};
use spatialvcs_types::SpatialError;

/// Persisted user configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Results returned by `/search` when no count is given.
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub frames: FrameProcessorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_k() -> usize {
    spatialvcs_memory::store::DEFAULT_K
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            detector: DetectorConfig::default(),
            frames: FrameProcessorConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

/// Return the path to `~/.spatialvcs/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".spatialvcs").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, SpatialError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, SpatialError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        SpatialError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| SpatialError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply environment overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SPATIALVCS_FRAMES_DIR` | `frames.frames_dir` |
/// | `SPATIALVCS_MEMORY_DIR` | `memory.persist_dir` |
/// | `SPATIALVCS_DEFAULT_K` | `default_k` |
/// | `SPATIAL_*` | detector settings, see [`DetectorConfig::apply_env_overrides`] |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SPATIALVCS_FRAMES_DIR") {
        cfg.frames.frames_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("SPATIALVCS_MEMORY_DIR") {
        cfg.memory.persist_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("SPATIALVCS_DEFAULT_K")
        && let Ok(k) = v.trim().parse::<usize>()
        && k > 0
    {
        cfg.default_k = k;
    }
    cfg.detector.apply_env_overrides();
}

/// Save the config to disk, creating `~/.spatialvcs/` if necessary.
pub fn save(cfg: &Config) -> Result<(), SpatialError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), SpatialError> {
    let io_err = |what: &str, e: std::io::Error| SpatialError::Config(format!("{what}: {e}"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create config directory", e))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to set config directory permissions", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| SpatialError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err(&format!("failed to write config at {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| io_err(&format!("failed to write config at {}", path.display()), e))?;
    Ok(())
}
