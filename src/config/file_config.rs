//! TOML file configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Optional settings loaded from a TOML file. Every field is optional;
/// file values override CLI values during resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub data_dir: Option<String>,
    pub music_dir: Option<String>,
    pub port: Option<u16>,
    pub video_api_url: Option<String>,
    #[serde(default)]
    pub mirror_urls: Vec<String>,
    pub catalog: Option<CatalogFileConfig>,
}

/// `[catalog]` section: the authenticated catalog API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFileConfig {
    pub api_base: Option<String>,
    pub token_url: Option<String>,
    pub web_base: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            data_dir = "/var/lib/grabbify"
            music_dir = "/srv/Music"
            port = 8090
            video_api_url = "https://api.tube.example"
            mirror_urls = ["https://m1.example", "https://m2.example"]

            [catalog]
            api_base = "https://api.music.example/v1"
            client_id = "abc"
        "#;
        let config: FileConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.data_dir.as_deref(), Some("/var/lib/grabbify"));
        assert_eq!(config.port, Some(8090));
        assert_eq!(config.mirror_urls.len(), 2);
        let catalog = config.catalog.unwrap();
        assert_eq!(catalog.client_id.as_deref(), Some("abc"));
        assert!(catalog.client_secret.is_none());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.data_dir.is_none());
        assert!(config.mirror_urls.is_empty());
        assert!(config.catalog.is_none());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(FileConfig::load(Path::new("/does/not/exist.toml")).is_err());
    }
}
