mod file_config;

pub use file_config::{CatalogFileConfig, FileConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::extractor::CatalogApiConfig;

/// Default public instance of the video platform API.
const DEFAULT_VIDEO_API_URL: &str = "https://pipedapi.kavin.rocks";

/// Fixed public client-credentials pair for the catalog API. Anonymous
/// read access only; a real deployment overrides these in the config file.
const DEFAULT_CATALOG_CLIENT_ID: &str = "5f573c9620494bae87890c0f08a60293";
const DEFAULT_CATALOG_CLIENT_SECRET: &str = "212476d9b0f3472eaa762d90b19b0ba8";

/// CLI arguments relevant for config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub music_dir: Option<PathBuf>,
    pub port: u16,
    pub video_api_url: Option<String>,
    pub mirror_urls: Vec<String>,
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding grabbify.db.
    pub data_dir: PathBuf,
    /// Final audio files land here.
    pub music_dir: PathBuf,
    pub port: u16,
    pub video_api_url: String,
    /// Mirror API instances, tried in order on primary failure.
    pub mirror_urls: Vec<String>,
    pub catalog: CatalogApiConfig,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and an optional TOML file.
    /// File values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("data_dir must be specified via --data-dir or in the config file")
            })?;
        if !data_dir.exists() {
            bail!("Data directory does not exist: {:?}", data_dir);
        }
        if !data_dir.is_dir() {
            bail!("data_dir is not a directory: {:?}", data_dir);
        }

        let music_dir = file
            .music_dir
            .map(PathBuf::from)
            .or_else(|| cli.music_dir.clone())
            .unwrap_or_else(|| data_dir.join("Music"));

        let port = file.port.unwrap_or(cli.port);

        let video_api_url = file
            .video_api_url
            .or_else(|| cli.video_api_url.clone())
            .unwrap_or_else(|| DEFAULT_VIDEO_API_URL.to_string());

        let mirror_urls = if file.mirror_urls.is_empty() {
            cli.mirror_urls.clone()
        } else {
            file.mirror_urls
        };

        let catalog_file = file.catalog.unwrap_or_default();
        let catalog = CatalogApiConfig {
            api_base: catalog_file
                .api_base
                .unwrap_or_else(|| "https://api.spotify.com/v1".to_string()),
            token_url: catalog_file
                .token_url
                .unwrap_or_else(|| "https://accounts.spotify.com/api/token".to_string()),
            web_base: catalog_file
                .web_base
                .unwrap_or_else(|| "https://open.spotify.com".to_string()),
            client_id: catalog_file
                .client_id
                .unwrap_or_else(|| DEFAULT_CATALOG_CLIENT_ID.to_string()),
            client_secret: catalog_file
                .client_secret
                .unwrap_or_else(|| DEFAULT_CATALOG_CLIENT_SECRET.to_string()),
        };

        Ok(Self {
            data_dir,
            music_dir,
            port,
            video_api_url,
            mirror_urls,
            catalog,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("grabbify.db")
    }
}
