use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::fingerprint::SignatureMode;

/// Run configuration.
///
/// Usually read from a TOML file:
///
/// ```toml
/// strict = false
/// force = false
/// workers = 4
/// signature = "content"
/// output_dir = "_output"
/// state_file = ".haori.state"
/// disabled_addons = ["archive"]
///
/// [addons.contents]
/// files = ["files"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Abort on the first failure instead of finishing all independent work.
    pub strict: bool,
    /// Treat every fingerprint as stale for this run.
    pub force: bool,
    /// Size of the worker pool, defaults to the number of CPUs.
    pub workers: Option<usize>,
    /// How dependency resources are signed.
    pub signature: SignatureMode,
    /// Directory of the assembled artifact tree, relative to the project root.
    pub output_dir: Utf8PathBuf,
    /// File holding the fingerprints, relative to the project root.
    pub state_file: Utf8PathBuf,
    /// Addons which are never constructed.
    pub disabled_addons: Vec<String>,
    /// Per-addon settings, keyed by addon name.
    pub addons: BTreeMap<String, toml::Table>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict: false,
            force: false,
            workers: None,
            signature: SignatureMode::default(),
            output_dir: Utf8PathBuf::from("_output"),
            state_file: Utf8PathBuf::from(".haori.state"),
            disabled_addons: Vec::new(),
            addons: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();

        let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&text).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates config from a TOML string.
    pub fn from_toml(text: &str) -> Result<Self, ConfigurationError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigurationError::Parse {
            path: Utf8PathBuf::from("<inline>"),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.workers == Some(0) {
            return Err(ConfigurationError::InvalidWorkers);
        }

        Ok(())
    }

    pub fn is_disabled(&self, addon: &str) -> bool {
        self.disabled_addons.iter().any(|name| name == addon)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.strict);
        assert_eq!(config.signature, SignatureMode::Content);
        assert_eq!(config.output_dir, "_output");
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml(
            r#"
            strict = true
            workers = 2
            signature = "mtime"
            disabled_addons = ["archive"]

            [addons.contents]
            files = ["files", "extra"]
            "#,
        )
        .unwrap();

        assert!(config.strict);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.signature, SignatureMode::Mtime);
        assert!(config.is_disabled("archive"));
        assert!(!config.is_disabled("contents"));
        assert!(config.addons["contents"].contains_key("files"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::from_toml("workers = 0").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidWorkers));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_toml("stirct = true").unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("haori.toml")).unwrap();
        fs::write(&path, "force = true").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.force);

        let missing = Config::load(path.with_file_name("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigurationError::Read { .. }));
    }
}
