//! Agent configuration.
//!
//! The agent needs no configuration to run; everything has a default matching
//! the managed-side tagger class. Overrides come from the option string passed
//! to the agent at load time, or from the environment:
//!
//! | Option | Variable | Default |
//! |--------|----------|---------|
//! | `class` | `HEAP_TAGS_CLASS` | `net/jonbell/examples/jvmti/tagging/runtime/Tagger` |
//! | `set_method` | `HEAP_TAGS_SET_METHOD` | `_setTag` |
//! | `get_method` | `HEAP_TAGS_GET_METHOD` | `_getTag` |
//! | `engaged_field` | `HEAP_TAGS_ENGAGED_FIELD` | `engaged` |
//! | `thread` | `HEAP_TAGS_THREAD` | `heap-tags-sweeper` |
//! | `final_sweep` | `HEAP_TAGS_FINAL_SWEEP` | `true` |
//!
//! ```rust,ignore
//! let config = AgentConfig::from_options("class=com/example/Tags,final_sweep=false")?;
//! ```

use std::env;

use crate::host::{NativeBinding, NativeMethod};

pub const DEFAULT_TAGGER_CLASS: &str = "net/jonbell/examples/jvmti/tagging/runtime/Tagger";
pub const DEFAULT_SET_METHOD: &str = "_setTag";
pub const DEFAULT_GET_METHOD: &str = "_getTag";
pub const DEFAULT_ENGAGED_FIELD: &str = "engaged";
pub const DEFAULT_SWEEPER_THREAD: &str = "heap-tags-sweeper";

/// `(Object obj, Object expr) -> void`
pub const SET_TAG_SIGNATURE: &str = "(Ljava/lang/Object;Ljava/lang/Object;)V";
/// `(Object obj) -> Object`
pub const GET_TAG_SIGNATURE: &str = "(Ljava/lang/Object;)Ljava/lang/Object;";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown agent option: {0}")]
    UnknownOption(String),

    #[error("agent option {0} has no value")]
    MissingValue(String),

    #[error("invalid value for agent option {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub tagger_class: String,
    pub set_method: String,
    pub get_method: String,
    pub engaged_field: String,
    pub sweeper_thread_name: String,
    /// Drain the cleanup queue once more when the agent is shut down explicitly.
    pub final_sweep_on_shutdown: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tagger_class: DEFAULT_TAGGER_CLASS.to_string(),
            set_method: DEFAULT_SET_METHOD.to_string(),
            get_method: DEFAULT_GET_METHOD.to_string(),
            engaged_field: DEFAULT_ENGAGED_FIELD.to_string(),
            sweeper_thread_name: DEFAULT_SWEEPER_THREAD.to_string(),
            final_sweep_on_shutdown: true,
        }
    }
}

impl AgentConfig {
    /// Parse a comma-separated `key=value` option string.
    ///
    /// An empty string yields the defaults.
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingValue(pair.to_string()))?;
            config.apply(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    /// Defaults overridden by `HEAP_TAGS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (key, var) in [
            ("class", "HEAP_TAGS_CLASS"),
            ("set_method", "HEAP_TAGS_SET_METHOD"),
            ("get_method", "HEAP_TAGS_GET_METHOD"),
            ("engaged_field", "HEAP_TAGS_ENGAGED_FIELD"),
            ("thread", "HEAP_TAGS_THREAD"),
            ("final_sweep", "HEAP_TAGS_FINAL_SWEEP"),
        ] {
            if let Ok(value) = env::var(var) {
                config.apply(key, &value)?;
            }
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::MissingValue(key.to_string()));
        }

        match key {
            "class" => self.tagger_class = value.replace('.', "/"),
            "set_method" => self.set_method = value.to_string(),
            "get_method" => self.get_method = value.to_string(),
            "engaged_field" => self.engaged_field = value.to_string(),
            "thread" => self.sweeper_thread_name = value.to_string(),
            "final_sweep" => {
                self.final_sweep_on_shutdown = parse_bool(value).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    }
                })?
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }

        Ok(())
    }

    pub fn tagger_class(mut self, class: impl Into<String>) -> Self {
        self.tagger_class = class.into();
        self
    }

    pub fn sweeper_thread_name(mut self, name: impl Into<String>) -> Self {
        self.sweeper_thread_name = name.into();
        self
    }

    pub fn final_sweep_on_shutdown(mut self, enabled: bool) -> Self {
        self.final_sweep_on_shutdown = enabled;
        self
    }

    /// The managed-side binding described by this configuration.
    pub fn native_binding(&self) -> NativeBinding {
        NativeBinding {
            class: self.tagger_class.clone(),
            set_tag: NativeMethod {
                name: self.set_method.clone(),
                signature: SET_TAG_SIGNATURE.to_string(),
            },
            get_tag: NativeMethod {
                name: self.get_method.clone(),
                signature: GET_TAG_SIGNATURE.to_string(),
            },
            engaged_field: self.engaged_field.clone(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options_are_defaults() {
        assert_eq!(AgentConfig::from_options("").unwrap(), AgentConfig::default());
        assert_eq!(AgentConfig::from_options(" , ").unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_options_override() {
        let config =
            AgentConfig::from_options("class=com.example.Tags, thread=sweeper,final_sweep=off")
                .unwrap();
        assert_eq!(config.tagger_class, "com/example/Tags");
        assert_eq!(config.sweeper_thread_name, "sweeper");
        assert!(!config.final_sweep_on_shutdown);
        assert_eq!(config.set_method, DEFAULT_SET_METHOD);
    }

    #[test]
    fn test_bad_options() {
        assert_eq!(
            AgentConfig::from_options("colour=blue"),
            Err(ConfigError::UnknownOption("colour".into()))
        );
        assert_eq!(
            AgentConfig::from_options("class"),
            Err(ConfigError::MissingValue("class".into()))
        );
        assert!(matches!(
            AgentConfig::from_options("final_sweep=maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_native_binding() {
        let binding = AgentConfig::default().native_binding();
        assert_eq!(binding.class, DEFAULT_TAGGER_CLASS);
        assert_eq!(binding.set_tag.name, "_setTag");
        assert_eq!(binding.set_tag.signature, SET_TAG_SIGNATURE);
        assert_eq!(binding.get_tag.signature, GET_TAG_SIGNATURE);
        assert_eq!(binding.engaged_field, "engaged");
    }
}
