//! Configuration types for the chat application.
//!
//! Endpoint settings come from four layers.  Later layers win:
//!
//! 1. built-in defaults,
//! 2. settings saved in the key-value store (`apiBase`, `apiKey`, `apiModel`),
//! 3. a YAML settings file named with `--settings`,
//! 4. command-line flags.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Store key holding the endpoint base URL.
pub const API_BASE_KEY: &str = "apiBase";
/// Store key holding the API key.
pub const API_KEY_KEY: &str = "apiKey";
/// Store key holding the model name.
pub const API_MODEL_KEY: &str = "apiModel";

/// Command-line arguments for the confab-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Endpoint base URL.
    #[arrrg(optional, "Endpoint base URL (default: http://localhost:4321)", "URL")]
    pub base_url: Option<String>,

    /// API key sent as a bearer token.
    #[arrrg(optional, "API key sent as a bearer token", "KEY")]
    pub api_key: Option<String>,

    /// Model to request.
    #[arrrg(optional, "Model to use (default: gpt-4o-mini)", "MODEL")]
    pub model: Option<String>,

    /// Request timeout in seconds.
    #[arrrg(optional, "Request timeout in seconds (default: 60)", "SECS")]
    pub timeout: Option<u64>,

    /// Directory holding saved conversations and settings.
    #[arrrg(optional, "Directory for saved state", "DIR")]
    pub state_dir: Option<String>,

    /// YAML file with endpoint settings.
    #[arrrg(optional, "YAML settings file", "FILE")]
    pub settings: Option<String>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

impl ChatArgs {
    fn overrides(&self) -> Settings {
        Settings {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            timeout_secs: self.timeout,
        }
    }
}

/// A partial set of endpoint settings.
///
/// Absent fields leave the underlying value alone when applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Endpoint base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Request timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Settings {
    /// Reads settings from a YAML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read {}: {e}", path.display()), e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Writes settings to a YAML file.
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)
            .map_err(|e| Error::io(format!("cannot write {}: {e}", path.display()), e))
    }

    /// Overlays `other` on `self`; fields set in `other` win.
    pub fn merge(mut self, other: Settings) -> Self {
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        self
    }

    /// Applies the fields that are set to `config`.
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(api_key) = &self.api_key {
            config = config.with_api_key(Some(api_key.clone()));
        }
        if let Some(model) = &self.model {
            config = config.with_model(model.clone());
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        config
    }
}

impl From<&ClientConfig> for Settings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            base_url: Some(config.base_url.clone()),
            api_key: config.api_key.clone(),
            model: Some(config.model.clone()),
            timeout_secs: Some(config.timeout_secs),
        }
    }
}

fn get_string(kv: &dyn KeyValueStore, key: &str) -> Result<Option<String>> {
    match kv.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn set_string(kv: &dyn KeyValueStore, key: &str, value: &str) -> Result<()> {
    kv.set(key, &serde_json::to_string(value)?)
}

/// Reads the endpoint settings saved in `kv`.
///
/// Each value is stored as a JSON string under its own key.  An empty
/// string counts as unset.
pub fn load_settings(kv: &dyn KeyValueStore) -> Result<Settings> {
    let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
    Ok(Settings {
        base_url: non_empty(get_string(kv, API_BASE_KEY)?),
        api_key: non_empty(get_string(kv, API_KEY_KEY)?),
        model: non_empty(get_string(kv, API_MODEL_KEY)?),
        timeout_secs: None,
    })
}

/// Saves the endpoint settings of `config` to `kv`.
///
/// A missing API key removes the stored one.
pub fn save_settings(kv: &dyn KeyValueStore, config: &ClientConfig) -> Result<()> {
    set_string(kv, API_BASE_KEY, &config.base_url)?;
    set_string(kv, API_MODEL_KEY, &config.model)?;
    match &config.api_key {
        Some(key) => set_string(kv, API_KEY_KEY, key),
        None => kv.remove(API_KEY_KEY),
    }
}

/// Returns the per-user directory for saved state, if the platform has one.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("confab"))
}

/// Configuration for a chat session.
///
/// This struct holds the resolved configuration values after processing
/// command-line arguments with appropriate defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Endpoint settings.
    pub client: ClientConfig,

    /// Directory for saved state; `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,
}

impl ChatConfig {
    /// Creates a configuration with default endpoint settings, color, and the
    /// platform state directory.
    pub fn new() -> Self {
        Self {
            client: ClientConfig::default(),
            state_dir: default_state_dir(),
            use_color: true,
        }
    }

    /// Sets the endpoint settings.
    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Sets the state directory.
    pub fn with_state_dir(mut self, state_dir: Option<PathBuf>) -> Self {
        self.state_dir = state_dir;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }

    /// Resolves the state directory from the arguments alone.
    ///
    /// The store must be opened before the remaining layers can be read.
    pub fn from_args(args: &ChatArgs) -> Self {
        let mut config = Self::new();
        if let Some(dir) = &args.state_dir {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if args.no_color {
            config = config.without_color();
        }
        config
    }

    /// Layers stored settings, the YAML file, and the arguments over the
    /// defaults and validates the result.
    pub fn resolve(mut self, args: &ChatArgs, kv: &dyn KeyValueStore) -> Result<Self> {
        let stored = match load_settings(kv) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable stored settings");
                Settings::default()
            }
        };
        let file = match &args.settings {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        let settings = stored.merge(file).merge(args.overrides());
        self.client = settings.apply(self.client);
        self.client.validate()?;
        Ok(self)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}
