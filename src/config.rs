use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{LibraryError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LibraryConfig {
    /// Everything the library writes lives under this directory.
    pub media_root: PathBuf,
    /// Subdirectory of `media_root` that mirrors the folder tree.
    pub images_dir: String,
    /// Defaults to `<media_root>/.media-folders.db`.
    pub database_path: Option<PathBuf>,
    pub media_url: String,
    pub max_conflict_attempts: u32,
    pub allowed_extensions: Vec<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("media"),
            images_dir: "original_images".to_string(),
            database_path: None,
            media_url: "/media/".to_string(),
            max_conflict_attempts: 100,
            allowed_extensions: ["gif", "jpg", "jpeg", "png"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl LibraryConfig {
    pub fn with_media_root(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.media_root.join(".media-folders.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.media_root.join("logs"))
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_conflict_attempts == 0 {
            return Err(LibraryError::validation(
                "max_conflict_attempts must be at least 1",
            ));
        }
        if self.images_dir.is_empty() || self.images_dir.contains(['/', '\\']) {
            return Err(LibraryError::validation(
                "images_dir must be a single directory name",
            ));
        }
        if self.allowed_extensions.is_empty() {
            return Err(LibraryError::validation("allowed_extensions is empty"));
        }
        Ok(())
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
    pub config: Mutex<LibraryConfig>,
}

impl ConfigManager {
    /// Loads `config_path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn new(config_path: &Path) -> Self {
        let config = if config_path.exists() {
            match fs::read_to_string(config_path)
                .map_err(LibraryError::from)
                .and_then(|content| Ok(serde_json::from_str(&content)?))
            {
                Ok(config) => config,
                Err(e) => {
                    log::warn!(
                        "Ignoring unreadable config {:?}: {}. Using defaults.",
                        config_path,
                        e
                    );
                    LibraryConfig::default()
                }
            }
        } else {
            LibraryConfig::default()
        };

        Self {
            config_path: config_path.to_path_buf(),
            config: Mutex::new(config),
        }
    }

    pub fn current(&self) -> Result<LibraryConfig> {
        let config = self.config.lock().map_err(|_| LibraryError::LockPoisoned)?;
        Ok(config.clone())
    }

    pub fn save(&self) -> Result<()> {
        let config = self.config.lock().map_err(|_| LibraryError::LockPoisoned)?;
        self.write(&config)
    }

    pub fn update(
        &self,
        media_root: Option<PathBuf>,
        max_conflict_attempts: Option<u32>,
        allowed_extensions: Option<Vec<String>>,
        log_level: Option<String>,
    ) -> Result<()> {
        let mut config = self.config.lock().map_err(|_| LibraryError::LockPoisoned)?;
        let mut next = config.clone();

        if let Some(root) = media_root {
            next.media_root = root;
        }
        if let Some(max) = max_conflict_attempts {
            next.max_conflict_attempts = max;
        }
        if let Some(exts) = allowed_extensions {
            next.allowed_extensions = exts;
        }
        if let Some(level) = log_level {
            next.log_level = level;
        }
        next.validate()?;

        // Save automatically on update
        self.write(&next)?;
        *config = next;
        Ok(())
    }

    fn write(&self, config: &LibraryConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }
}
