use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::detect::FacePolicy;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("IDSNAP_CONFIG_PATH").unwrap_or("/usr/local/etc/idsnap/config.toml"))
});

pub static STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("IDSNAP_STORE_PREFIX").unwrap_or("/usr/local/var/idsnap"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// A match needs similarity strictly above this.
    pub threshold: f32,
    /// Embedding width produced by the face model.
    pub dimension: usize,
    pub snapshot: PathBuf,
    pub face_policy: FacePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            dimension: 512,
            snapshot: STORE_PREFIX.join("gallery.bin"),
            face_policy: FacePolicy::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(-1.0..=1.0).contains(&self.threshold) {
            anyhow::bail!("threshold must lie in [-1, 1], got {}", self.threshold);
        }
        if self.dimension == 0 {
            anyhow::bail!("dimension must be positive");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
