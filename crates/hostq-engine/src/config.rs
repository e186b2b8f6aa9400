use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use hostq_core::Priority;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; `~` is expanded, relative paths resolve against the
    /// directory holding `.hostq/`.
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Verification retries before a profile delivery is marked failed.
    pub max_profile_retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub setup_experience_priority: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Used when RUST_LOG is unset.
    pub filter: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_profile_retries: 1,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            setup_experience_priority: Priority::SETUP_EXPERIENCE.0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                path: ".hostq/hostq.db".to_string(),
            },
            delivery: DeliveryConfig::default(),
            queue: QueueConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: EngineConfig = toml::from_str(&s).with_context(|| "parse hostq.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(&self.store.path).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            root.join(expanded)
        }
    }

    pub fn setup_priority(&self) -> Priority {
        Priority(self.queue.setup_experience_priority)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(".hostq").join("hostq.toml")
    }
}
