//! Engine configuration files.
//!
//! ```toml
//! libraries = ["string", "table", "math", "package"]
//!
//! [sandbox]
//! enabled = true
//! env_name = "__sandbox"
//! setup_file = "sandbox.lua"
//! ```

use crate::error::{BridgeError, BridgeResult};
use crate::library::Library;
use crate::sandbox::{Sandbox, DEFAULT_ENV_NAME, DEFAULT_SETUP_SCRIPT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How to build an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Standard libraries to open. All of them when unset.
    #[serde(default)]
    pub libraries: Option<Vec<Library>>,

    /// Secure mode settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// Secure mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Run the engine in secure mode.
    #[serde(default)]
    pub enabled: bool,

    /// Global holding the restricted environment.
    #[serde(default = "default_env_name")]
    pub env_name: String,

    /// Inline setup script.
    #[serde(default)]
    pub setup_script: Option<String>,

    /// Setup script file. Relative paths resolve against the config file.
    #[serde(default)]
    pub setup_file: Option<PathBuf>,
}

fn default_env_name() -> String {
    DEFAULT_ENV_NAME.to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            env_name: default_env_name(),
            setup_script: None,
            setup_file: None,
        }
    }
}

impl EngineConfig {
    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_str(&content)?;

        if let (Some(file), Some(dir)) = (&config.sandbox.setup_file, path.parent()) {
            if file.is_relative() {
                config.sandbox.setup_file = Some(dir.join(file));
            }
        }

        Ok(config)
    }

    /// Parse a config from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> BridgeResult<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BridgeResult<()> {
        if self.sandbox.env_name.is_empty() {
            return Err(BridgeError::Config(
                "sandbox env_name cannot be empty".to_string(),
            ));
        }

        if self.sandbox.setup_script.is_some() && self.sandbox.setup_file.is_some() {
            return Err(BridgeError::Config(
                "sandbox setup_script and setup_file are mutually exclusive".to_string(),
            ));
        }

        Ok(())
    }

    /// The sandbox to install, if secure mode is enabled.
    pub fn sandbox(&self) -> BridgeResult<Option<Sandbox>> {
        let config = &self.sandbox;
        if !config.enabled {
            return Ok(None);
        }

        let sandbox = match (&config.setup_script, &config.setup_file) {
            (Some(script), _) => Sandbox::new(script.as_str(), config.env_name.as_str()),
            (None, Some(file)) => Sandbox::from_file(file, config.env_name.as_str())?,
            (None, None) => Sandbox::new(DEFAULT_SETUP_SCRIPT, config.env_name.as_str()),
        };
        Ok(Some(sandbox))
    }
}
