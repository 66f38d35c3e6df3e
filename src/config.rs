// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::BackendKind;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub device: DeviceConfig,
    pub descriptors: DescriptorConfig,
    pub staging: StagingConfig,
    pub debug: DebugConfig,
}

/// Backend selection, resolved once at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Vulkan,
        }
    }
}

/// Adapter and logical device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub validation_layers: bool,
    pub prefer_discrete_gpu: bool,
    /// Request ray tracing extensions if the adapter has them
    pub enable_ray_tracing: bool,
    /// Request mesh shading extensions if the adapter has them
    pub enable_mesh_shading: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "RHI Application".to_string(),
            validation_layers: true,
            prefer_discrete_gpu: true,
            enable_ray_tracing: true,
            enable_mesh_shading: false,
        }
    }
}

/// Per-category descriptor heap capacities
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub uniform_capacity: u32,
    pub storage_capacity: u32,
    pub sampler_capacity: u32,
    pub acceleration_structure_capacity: u32,
    pub image_capacity: u32,
    pub max_sets: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            uniform_capacity: 1024,
            storage_capacity: 1024,
            sampler_capacity: 128,
            acceleration_structure_capacity: 16,
            image_capacity: 4096,
            max_sets: 512,
        }
    }
}

impl DescriptorConfig {
    /// Capacities indexed by `DescriptorCategory::index`
    pub fn capacities(&self) -> [u32; 5] {
        [
            self.uniform_capacity,
            self.storage_capacity,
            self.sampler_capacity,
            self.acceleration_structure_capacity,
            self.image_capacity,
        ]
    }
}

/// Transient upload / build-scratch pools
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Size of every staging block unless a request is larger
    pub staging_block_size: u64,
    /// Hard cap per pool; exceeding it is fatal
    pub max_pool_entries: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_block_size: 64 * 1024 * 1024,
            max_pool_entries: 4,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "rhi_debug.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults with the headless backend selected, for tests and tools
    pub fn headless() -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Headless,
            },
            ..Default::default()
        }
    }

    /// Get log level as `log` filter
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "info" => log::LevelFilter::Info,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => {
                log::warn!(
                    "Unknown log level '{}', defaulting to info",
                    self.debug.log_level
                );
                log::LevelFilter::Info
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::Vulkan);
        assert_eq!(config.staging.max_pool_entries, 4);
        assert_eq!(config.descriptors.capacities()[2], 128);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [backend]
            kind = "headless"

            [staging]
            staging_block_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Headless);
        assert_eq!(config.staging.staging_block_size, 4096);
        assert_eq!(config.staging.max_pool_entries, 4);
        assert!(config.device.validation_layers);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Config::from_toml("[backend]\nkind = \"metal\"").is_err());
    }

    #[test]
    fn log_level_parsing() {
        let mut config = Config::default();
        config.debug.log_level = "DEBUG".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        config.debug.log_level = "loud".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
