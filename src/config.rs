use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{accel::DEFAULT_BATCH_BUDGET, vulkan::window_settings::PresentMode};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frames_in_flight must be 2 or 3, got {0}")]
    FramesInFlight(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub present_mode: PresentMode,
    pub frames_in_flight: usize,
    pub blas_batch_budget: u64,
    pub compact_blas: bool,
    pub clear_color: [f32; 4],
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            present_mode: PresentMode::Fifo,
            frames_in_flight: 2,
            blas_batch_budget: DEFAULT_BATCH_BUDGET,
            compact_blas: true,
            clear_color: [0.1, 0.1, 0.12, 1.0],
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(value: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=3).contains(&self.frames_in_flight) {
            return Err(ConfigError::FramesInFlight(self.frames_in_flight));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Unnamed Engine".to_string(),
            width: 800,
            height: 600,
        }
    }
}

pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<EngineConfig>,
}

impl ConfigFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: None,
        }
    }

    /// Reads the config file, writing out the defaults if there is none yet.
    pub fn load_config(&mut self) -> Result<&mut EngineConfig, ConfigError> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => EngineConfig::from_json(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = EngineConfig::default();
                self.config = Some(config.clone());
                self.save_config()?;
                config
            }
            Err(err) => return Err(err.into()),
        };
        Ok(self.config.insert(config))
    }

    pub fn get_or_load_config(&mut self) -> Result<&mut EngineConfig, ConfigError> {
        if self.config.is_none() {
            self.load_config()?;
        }
        Ok(self.config.get_or_insert_with(EngineConfig::default))
    }

    pub fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut loader = ConfigFileLoader::new(&path);

        let config = loader.load_config().unwrap();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.blas_batch_budget, 256 * 1024 * 1024);

        let written = std::fs::read_to_string(&path).unwrap();
        let reread = EngineConfig::from_json(&written).unwrap();
        assert_eq!(reread.window.title, "Unnamed Engine");
    }

    #[test]
    fn loads_the_file_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "frames_in_flight": 3 }"#).unwrap();
        let mut loader = ConfigFileLoader::new(&path);

        loader.get_or_load_config().unwrap().compact_blas = false;
        std::fs::write(&path, r#"{ "frames_in_flight": 2 }"#).unwrap();

        let config = loader.get_or_load_config().unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert!(!config.compact_blas);
    }

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let config =
            EngineConfig::from_json(r#"{ "frames_in_flight": 3, "present_mode": "Mailbox" }"#)
                .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert!(matches!(config.present_mode, PresentMode::Mailbox));
        assert!(config.compact_blas);
    }

    #[test]
    fn rejects_unsupported_frame_counts() {
        let err = EngineConfig::from_json(r#"{ "frames_in_flight": 5 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::FramesInFlight(5)));
    }

    #[test]
    fn reports_broken_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mut loader = ConfigFileLoader::new(&path);
        assert!(matches!(loader.load_config(), Err(ConfigError::Json(_))));
    }
}
