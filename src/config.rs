//! Plugin Configuration
//!
//! Handles parsing and management of solver-plugins.toml configuration
//! files, which tell the adapters where to find the vendor libraries and
//! how to construct them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::locate::LibrarySpec;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching solver-plugins.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginConfig {
    /// SNOPT7 library settings
    #[serde(default)]
    pub snopt7: Snopt7Config,

    /// WORHP library settings
    #[serde(default)]
    pub worhp: WorhpConfig,
}

impl PluginConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: PluginConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("solver-plugins.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// SNOPT7 library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snopt7Config {
    /// Explicit path to the snopt7_c shared library; wins over `name`
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// Base name to probe for when no explicit path is given
    #[serde(default = "default_snopt7_name")]
    pub name: String,

    /// Directories probed for `name`, in order; platform defaults if empty
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    /// Route the solver's own summary output to the terminal
    #[serde(default)]
    pub screen_output: bool,

    /// Declared 7.x interface version of the library
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
}

fn default_snopt7_name() -> String {
    "snopt7_c".to_string()
}

fn default_minor_version() -> u32 {
    7
}

impl Default for Snopt7Config {
    fn default() -> Self {
        Self {
            library: None,
            name: default_snopt7_name(),
            search_dirs: Vec::new(),
            screen_output: false,
            minor_version: default_minor_version(),
        }
    }
}

impl Snopt7Config {
    /// The library spec this section describes.
    pub fn spec(&self) -> LibrarySpec {
        spec_from(&self.library, &self.name, &self.search_dirs)
    }
}

/// WORHP library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorhpConfig {
    /// Explicit path to the worhp shared library; wins over `name`
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// Base name to probe for when no explicit path is given
    #[serde(default = "default_worhp_name")]
    pub name: String,

    /// Directories probed for `name`, in order; platform defaults if empty
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    /// Route the solver's own status output to the terminal
    #[serde(default)]
    pub screen_output: bool,
}

fn default_worhp_name() -> String {
    "worhp".to_string()
}

impl Default for WorhpConfig {
    fn default() -> Self {
        Self {
            library: None,
            name: default_worhp_name(),
            search_dirs: Vec::new(),
            screen_output: false,
        }
    }
}

impl WorhpConfig {
    /// The library spec this section describes.
    pub fn spec(&self) -> LibrarySpec {
        spec_from(&self.library, &self.name, &self.search_dirs)
    }
}

fn spec_from(library: &Option<PathBuf>, name: &str, search_dirs: &[PathBuf]) -> LibrarySpec {
    match library {
        Some(path) => LibrarySpec::at(path.clone()),
        None if search_dirs.is_empty() => LibrarySpec::named_on_default_path(name),
        None => LibrarySpec::named(name, search_dirs.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PluginConfig::default();
        assert_eq!(config.snopt7.name, "snopt7_c");
        assert_eq!(config.snopt7.minor_version, 7);
        assert_eq!(config.worhp.name, "worhp");
        assert!(!config.worhp.screen_output);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[snopt7]
library = "/opt/snopt/libsnopt7_c.so"
screen_output = true
minor_version = 6

[worhp]
name = "worhp"
search_dirs = ["/opt/worhp/lib"]
"#;
        let config: PluginConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.snopt7.library.as_deref(),
            Some(Path::new("/opt/snopt/libsnopt7_c.so"))
        );
        assert!(config.snopt7.screen_output);
        assert_eq!(config.snopt7.minor_version, 6);
        assert_eq!(config.worhp.search_dirs.len(), 1);
    }

    #[test]
    fn test_spec_selection() {
        let mut config = PluginConfig::default();
        assert!(matches!(
            config.snopt7.spec(),
            LibrarySpec::Named { .. }
        ));
        config.snopt7.library = Some(PathBuf::from("/tmp/libsnopt7_c.so"));
        assert!(matches!(config.snopt7.spec(), LibrarySpec::Path(_)));
        config.worhp.search_dirs = vec![PathBuf::from("/opt/worhp/lib")];
        match config.worhp.spec() {
            LibrarySpec::Named { search_dirs, .. } => {
                assert_eq!(search_dirs, vec![PathBuf::from("/opt/worhp/lib")]);
            }
            other => panic!("unexpected spec: {other:?}"),
        }
    }
}
