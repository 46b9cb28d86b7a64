//! Application configuration

use offlinekit_common::{LogConfig, OfflineKitError, Result, ResultExt};
use offlinekit_sw::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use crate::bootstrap::RegistrationRequest;

/// Application configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// URL the page is served from
    pub page_url: String,

    /// Page to bootstrap
    pub index_html: PathBuf,

    /// Id of the element the application mounts into
    pub root_element_id: String,

    /// Built assets, served at the page origin
    pub assets_dir: PathBuf,

    /// Service worker script, relative to the page
    pub script_url: String,

    /// Service worker scope, relative to the page
    pub scope: String,

    /// User data directory
    pub data_dir: PathBuf,

    /// Service worker manager settings
    pub service_worker: ManagerConfig,

    /// Logging settings
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            page_url: "http://localhost:3000/".to_string(),
            index_html: PathBuf::from("build/index.html"),
            root_element_id: "root".to_string(),
            assets_dir: PathBuf::from("build"),
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offlinekit"),
            service_worker: ManagerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .config_context(format!("reading {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&text)
            .config_context(format!("parsing {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn page_url(&self) -> Result<Url> {
        Url::parse(&self.page_url).config_context(format!("invalid page_url {:?}", self.page_url))
    }

    /// File holding the activation markers.
    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join("markers.json")
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            script_url: self.script_url.clone(),
            scope: self.scope.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let page_url = self.page_url()?;
        if page_url.cannot_be_a_base() {
            return Err(OfflineKitError::config(format!(
                "page_url {} cannot resolve relative URLs",
                page_url
            )));
        }
        if self.root_element_id.is_empty() {
            return Err(OfflineKitError::config("root_element_id is empty"));
        }
        if self.script_url.is_empty() {
            return Err(OfflineKitError::config("script_url is empty"));
        }
        if self.service_worker.retry.max_attempts == 0 {
            return Err(OfflineKitError::config(
                "service_worker.retry.max_attempts must be at least 1",
            ));
        }
        if !self.service_worker.retry.has_valid_multiplier() {
            return Err(OfflineKitError::config(format!(
                "service_worker.retry.backoff_multiplier must be finite and at least 1.0, got {}",
                self.service_worker.retry.backoff_multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offlinekit_common::LogFormat;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.root_element_id, "root");
        assert_eq!(config.service_worker.retry.max_attempts, 1);
        assert!(config.marker_path().ends_with("offlinekit/markers.json"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offlinekit.json");
        std::fs::write(
            &path,
            r#"{
                "page_url": "https://flappy.example/game/",
                "scope": "/game/",
                "service_worker": {
                    "retry": { "max_attempts": 3, "initial_delay_ms": 250 }
                },
                "log": { "level": "debug", "format": "json" }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.page_url().unwrap().path(), "/game/");
        assert_eq!(config.scope, "/game/");
        assert_eq!(config.script_url, "/sw.js");
        assert_eq!(config.service_worker.retry.max_attempts, 3);
        assert_eq!(
            config.service_worker.retry.initial_delay,
            Duration::from_millis(250)
        );
        assert!(config.service_worker.enabled);
        assert_eq!(config.log.format, LogFormat::Json);

        let request = config.registration_request();
        assert_eq!(request.scope, "/game/");
    }

    #[test]
    fn test_load_rejects_bad_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offlinekit.json");
        std::fs::write(&path, r#"{ "page_url": "not a url" }"#).unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = AppConfig::load_or_default(None).unwrap();
        assert_eq!(config.page_url, "http://localhost:3000/");
    }

    #[test]
    fn test_negative_backoff_multiplier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offlinekit.json");
        std::fs::write(
            &path,
            r#"{ "service_worker": { "retry": { "max_attempts": 3, "backoff_multiplier": -2.0 } } }"#,
        )
        .unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = AppConfig::default();
        config.service_worker.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
