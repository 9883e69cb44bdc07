use anyhow::{Context, Result};
use isoworld_server::{ServerSettings, UploadLimits};
use isoworld_world::{GridDims, TerrainConfig};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/isoworld.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name reported to joining clients.
    pub name: String,
    pub port: u16,
    pub max_connections: usize,
    /// Empty or absent means no password.
    pub password: Option<String>,
    /// Sessions advanced per tick.
    pub max_concurrent_uploads: usize,
    /// Chunks each serviced session sends per tick.
    pub max_chunks_per_tick: usize,
    /// Cells per world chunk.
    pub chunk_size: usize,
    pub world_width: u32,
    pub world_depth: u32,
    pub world_height: u32,
    /// Terrain seed.
    pub seed: u32,
    /// Simulation ticks per second.
    pub tick_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = UploadLimits::default();
        Self {
            name: "isoworld".to_string(),
            port: 14242,
            max_connections: 16,
            password: None,
            max_concurrent_uploads: limits.max_concurrent_uploads,
            max_chunks_per_tick: limits.max_chunks_per_tick,
            chunk_size: limits.chunk_size,
            world_width: 100,
            world_depth: 100,
            world_height: 3,
            seed: TerrainConfig::default().seed,
            tick_rate: 20,
        }
    }
}

impl ServerConfig {
    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            name: self.name.clone(),
            password: self.password.clone().filter(|p| !p.trim().is_empty()),
            max_connections: self.max_connections,
            uploads: UploadLimits {
                max_concurrent_uploads: self.max_concurrent_uploads,
                max_chunks_per_tick: self.max_chunks_per_tick,
                chunk_size: self.chunk_size,
            },
        }
    }

    pub fn world_dims(&self) -> Result<GridDims> {
        GridDims::new(self.world_width, self.world_depth, self.world_height)
            .context("Invalid world dimensions in config")
    }

    pub fn terrain(&self) -> TerrainConfig {
        TerrainConfig {
            seed: self.seed,
            ..TerrainConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    /// Server address used by `join` when none is given.
    pub server_address: String,
    pub password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            server_address: "127.0.0.1:14242".to_string(),
            password: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    AppConfig::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!("Config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                AppConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_concurrent_uploads, 2);
        assert_eq!(cfg.max_chunks_per_tick, 4);
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.world_dims().unwrap().volume(), 30_000);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("isoworld.toml");
        let mut cfg = AppConfig::default();
        cfg.server.password = Some("secret".into());
        cfg.server.port = 9000;
        cfg.client.name = "ann".into();
        cfg.save_to_path(&path).unwrap();

        assert_eq!(AppConfig::load_from_path(&path), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isoworld.toml");
        fs::write(&path, "[server]\nport = 5000\n").unwrap();
        let cfg = AppConfig::load_from_path(&path);
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.server.chunk_size, 512);
        assert_eq!(cfg.client, ClientConfig::default());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isoworld.toml");
        fs::write(&path, "server = [").unwrap();
        assert_eq!(AppConfig::load_from_path(&path), AppConfig::default());
        assert_eq!(
            AppConfig::load_from_path(&dir.path().join("missing.toml")),
            AppConfig::default()
        );
    }

    #[test]
    fn blank_password_means_none() {
        let cfg = ServerConfig {
            password: Some("  ".into()),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.settings().password, None);
    }
}
