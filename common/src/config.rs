use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::error::BackupError;

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
const DEFAULT_DOWNLOAD_BATCH_SIZE: usize = 5;
const DEFAULT_DOWNLOAD_BATCH_SIZE_BYTES: i64 = 100 * 1024 * 1024;
const DEFAULT_MAX_DOWNLOAD_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: f64 = 2.0;
const DEFAULT_MAX_FILE_SIZE: i64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultConfig {
    // remote api credentials; both must be non-empty before a session
    // can be opened
    #[serde(default)]
    pub api_id: String,

    #[serde(default)]
    pub api_hash: String,

    // root folder under which each entity gets "<id>_<name>/"
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    // hard cap on simultaneous in-flight downloads
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    // batch flush thresholds, by item count and by cumulative bytes
    #[serde(default = "default_download_batch_size")]
    pub download_batch_size: usize,

    #[serde(default = "default_download_batch_size_bytes")]
    pub download_batch_size_bytes: i64,

    #[serde(default = "default_max_download_retries")]
    pub max_download_retries: u32,

    // base of the exponential backoff, in seconds
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,

    // declared sizes above this are skipped outright
    #[serde(default = "default_max_file_size")]
    pub max_file_size: i64,

    // content hash recorded in each store; "xxh3-128" or "sha-256"
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("backups")
}

fn default_max_concurrent_downloads() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

fn default_download_batch_size() -> usize {
    DEFAULT_DOWNLOAD_BATCH_SIZE
}

fn default_download_batch_size_bytes() -> i64 {
    DEFAULT_DOWNLOAD_BATCH_SIZE_BYTES
}

fn default_max_download_retries() -> u32 {
    DEFAULT_MAX_DOWNLOAD_RETRIES
}

fn default_retry_delay_secs() -> f64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_max_file_size() -> i64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_hash_algorithm() -> String {
    "xxh3-128".to_owned()
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            api_id: String::new(),
            api_hash: String::new(),
            backup_root: default_backup_root(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_batch_size: default_download_batch_size(),
            download_batch_size_bytes: default_download_batch_size_bytes(),
            max_download_retries: default_max_download_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            max_file_size: default_max_file_size(),
            hash_algorithm: default_hash_algorithm(),
        }
    }
}

impl VaultConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    // credentials are validated up front so a missing key surfaces as an
    // auth failure before any entity work starts
    pub fn validate_credentials(&self) -> Result<()> {
        if self.api_id.trim().is_empty() || self.api_hash.trim().is_empty() {
            return Err(BackupError::AuthFailed(
                "API_ID and API_HASH must be set and non-empty".to_owned(),
            )
            .into());
        }

        Ok(())
    }

    // environment variables take precedence over the config file, using
    // the historical key names
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = env::var("API_ID") {
            self.api_id = val;
        }

        if let Ok(val) = env::var("API_HASH") {
            self.api_hash = val;
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_DOWNLOADS") {
            self.max_concurrent_downloads = val.parse()?;
        }

        if let Ok(val) = env::var("DOWNLOAD_BATCH_SIZE") {
            self.download_batch_size = val.parse()?;
        }

        if let Ok(val) = env::var("DOWNLOAD_BATCH_SIZE_BYTES") {
            self.download_batch_size_bytes = val.parse()?;
        }

        if let Ok(val) = env::var("MAX_DOWNLOAD_RETRIES") {
            self.max_download_retries = val.parse()?;
        }

        if let Ok(val) = env::var("RETRY_DELAY") {
            self.retry_delay_secs = val.parse()?;
        }

        if let Ok(val) = env::var("MAX_FILE_SIZE") {
            self.max_file_size = val.parse()?;
        }

        Ok(())
    }
}

// in order to extract the config table from a larger document, we specify it
// as a subtable of the root node, i.e. a substruct
#[derive(Debug, Serialize, Deserialize)]
struct TomlConfigFile {
    config: VaultConfig,
}

#[instrument(level = Level::DEBUG)]
pub async fn read_config(filename: Option<PathBuf>) -> Result<Arc<VaultConfig>> {
    let mut config = match filename {
        Some(filename) => {
            debug!("reading config file");

            let doc = tokio::fs::read_to_string(filename).await?;

            let data: TomlConfigFile = toml::from_str(&doc)?;

            data.config
        }
        None => VaultConfig::default(),
    };

    config.apply_env()?;

    debug!("successfully loaded config");
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = VaultConfig::default();

        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.download_batch_size, 5);
        assert_eq!(config.download_batch_size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_download_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.max_file_size, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let mut config = VaultConfig::default();
        assert!(config.validate_credentials().is_err());

        config.api_id = "12345".to_owned();
        config.api_hash = "abcdef".to_owned();
        assert!(config.validate_credentials().is_ok());
    }

    #[test]
    fn config_parses_from_toml_subtable() {
        let doc = r#"
            [config]
            api_id = "12345"
            api_hash = "abcdef"
            max_concurrent_downloads = 2
            retry_delay_secs = 0.5
        "#;

        let data: TomlConfigFile = toml::from_str(doc).unwrap();

        assert_eq!(data.config.max_concurrent_downloads, 2);
        assert_eq!(data.config.retry_delay(), Duration::from_millis(500));
        assert_eq!(data.config.download_batch_size, 5);
    }
}
