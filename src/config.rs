//! Local service configuration: where session records and the failure
//! journal live, and the build fingerprint the last staging ran under.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use airlock_api::error::{AirlockError, InitializationError, ReportError};

use crate::{AIRLOCK_DATASTORE_PATH, AIRLOCK_JOURNAL_PATH};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_log_path: Option<PathBuf>,

    /// Fingerprint of the build the persisted sessions were staged under.
    /// A mismatch on load means the device was upgraded in between.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_fingerprint: Option<String>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, AirlockError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .structured(InitializationError::LoadLocalConfig)?;
        serde_yaml::from_str(&contents).structured(InitializationError::ParseLocalConfig)
    }

    pub fn datastore_path(&self) -> PathBuf {
        self.datastore_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(AIRLOCK_DATASTORE_PATH))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(AIRLOCK_JOURNAL_PATH))
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = ServiceConfig::load(Path::new("/does/not/exist")).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.datastore_path(), PathBuf::from(AIRLOCK_DATASTORE_PATH));
        assert_eq!(config.journal_path(), PathBuf::from(AIRLOCK_JOURNAL_PATH));
    }

    #[test]
    fn test_parse_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            indoc! {r#"
                datastorePath: /tmp/airlock/sessions.sqlite
                buildFingerprint: vendor/device:14/build.1
            "#},
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(
            config.datastore_path(),
            PathBuf::from("/tmp/airlock/sessions.sqlite")
        );
        assert_eq!(
            config.build_fingerprint.as_deref(),
            Some("vendor/device:14/build.1")
        );
        // Unset paths keep their defaults.
        assert_eq!(config.journal_path(), PathBuf::from(AIRLOCK_JOURNAL_PATH));
    }
}
