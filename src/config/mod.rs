//! Layered build configuration store.
//!
//! Values merge in a fixed precedence order: built-in defaults, then the
//! config file (following `include`/`include_optional` lists), then
//! `KEY=VALUE` overrides, then `PACKERMATE_*` environment variables.
//! Every read goes through placeholder expansion; only the expansion
//! engine itself ever sees raw strings.

mod dump;
pub mod value;

use crate::files::get_path_names;
use crate::identity::IdentityProvider;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use value::ConfigValue;

/// Environment variables with this prefix merge into the store, prefix
/// stripped, overriding file and CLI values.
pub const ENV_VAR_PREFIX: &str = "PACKERMATE_";

/// Key recording the name of the initially loaded config file.
pub const CONFIG_FILE_NAME_KEY: &str = "config_file_name";

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A config source could not be read at all. Optional includes
    /// tolerate this kind; nothing tolerates the others.
    #[error("unable to load config: '{0}'")]
    Load(String),

    /// A config source was readable but malformed.
    #[error("{0}")]
    Format(String),

    #[error("invalid parameter: '{0}'")]
    Override(String),

    #[error("config provider not set")]
    ProviderName,

    /// Placeholder expansion failure.
    #[error("{0}")]
    Expand(String),

    /// Expansion failure annotated with the raw value it came from.
    #[error("{message}\n  line='{line}'")]
    ExpandLine { message: String, line: String },
}

/// Kind tags for [`Value`], used in parameter binding diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Str => "string",
            ValueKind::Int => "integer",
            ValueKind::Bool => "boolean",
            ValueKind::List => "list",
            ValueKind::Map => "mapping",
        };
        f.write_str(name)
    }
}

/// A configuration value.
///
/// YAML floats load as their string rendering and YAML nulls load as
/// unset; the store itself only ever holds these five kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Render a scalar to a string; `None` for lists and mappings.
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::List(_) | Value::Map(_) => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Int(i) => *i != 0,
            Value::Bool(b) => *b,
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert a parsed YAML value; `None` for null documents.
    pub fn from_yaml(yaml: serde_yaml::Value) -> Option<Value> {
        match yaml {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(b) => Some(Value::Bool(b)),
            serde_yaml::Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            }),
            serde_yaml::Value::String(s) => Some(Value::Str(s)),
            serde_yaml::Value::Sequence(items) => Some(Value::List(
                items.into_iter().filter_map(Value::from_yaml).collect(),
            )),
            serde_yaml::Value::Mapping(map) => Some(Value::Map(
                map.into_iter()
                    .filter_map(|(key, value)| {
                        Some((yaml_key_string(key)?, Value::from_yaml(value)?))
                    })
                    .collect(),
            )),
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(tagged.value),
        }
    }
}

fn yaml_key_string(key: serde_yaml::Value) -> Option<String> {
    match key {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

/// Read access shared by [`Config`] and [`ConfigProvider`].
pub trait ConfigView {
    /// The expanded value for a key, or `None` when unset.
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError>;

    fn contains(&self, key: &str) -> bool;

    fn expand_value(&self, value: &Value) -> Result<Value, ConfigError>;

    fn get_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key)? {
            Some(value) => value
                .render()
                .map(Some)
                .ok_or_else(|| ConfigError::Expand(format!("cannot expand non-scalar value: {key}"))),
            None => Ok(None),
        }
    }

    fn is_truthy(&self, key: &str) -> Result<bool, ConfigError> {
        Ok(self.get(key)?.is_some_and(|value| value.is_truthy()))
    }
}

fn config_defaults() -> BTreeMap<String, Value> {
    BTreeMap::from([
        (
            "shell_command".to_string(),
            Value::from("{{ .Vars }} bash '{{ .Path }}'"),
        ),
        (
            "shell_command_sudo".to_string(),
            Value::from("sudo -H -S {{ .Vars }} bash '{{ .Path }}'"),
        ),
        ("packer_command".to_string(), Value::from("packer")),
        ("vagrant_command".to_string(), Value::from("vagrant")),
    ])
}

/// The merged key/value store.
pub struct Config {
    values: BTreeMap<String, Value>,
    path_list: Vec<PathBuf>,
    uuid_cache: RefCell<HashMap<String, String>>,
    identity: Option<Box<dyn IdentityProvider>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// A store holding only the built-in defaults.
    pub fn new() -> Config {
        Config::with_paths(vec![PathBuf::new()])
    }

    pub fn with_paths(path_list: Vec<PathBuf>) -> Config {
        let path_list = if path_list.is_empty() {
            vec![PathBuf::new()]
        } else {
            path_list
        };

        Config {
            values: config_defaults(),
            path_list,
            uuid_cache: RefCell::new(HashMap::new()),
            identity: None,
        }
    }

    /// Full production merge: defaults, file (with includes), overrides,
    /// environment variables.
    pub fn load(
        file_name: &str,
        overrides: &[String],
        path_list: Vec<PathBuf>,
    ) -> Result<Config, ConfigError> {
        let mut config = Config::with_paths(path_list);
        config.set(CONFIG_FILE_NAME_KEY, Value::from(file_name));
        config.read_config_file(file_name, true)?;
        config.apply_overrides(overrides)?;
        config.merge_env_vars();
        Ok(config)
    }

    /// A store merged from defaults and an inline YAML document.
    pub fn from_string(data: &str) -> Result<Config, ConfigError> {
        let mut config = Config::new();
        config.read_config_string(data)?;
        Ok(config)
    }

    pub fn set_identity_provider(&mut self, provider: Box<dyn IdentityProvider>) {
        self.identity = Some(provider);
    }

    pub(crate) fn identity(&self) -> Option<&dyn IdentityProvider> {
        self.identity.as_deref()
    }

    pub(crate) fn search_paths(&self) -> &[PathBuf] {
        &self.path_list
    }

    /// The raw, unexpanded value for a key.
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Set or, when `value` is `None`, delete.
    pub fn set_opt(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => self.set(key, value),
            None => self.delete(key),
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Expand a raw string through the placeholder engine.
    pub fn expand_str(&self, value: &str) -> Result<String, ConfigError> {
        ConfigValue::new(self, value).evaluate()
    }

    /// Memoized random identifier; the same name always maps to the same
    /// value within one run.
    pub fn get_uuid(&self, name: &str) -> String {
        self.uuid_cache
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Uuid::new_v4().simple().to_string())
            .clone()
    }

    /// A view reading and writing under a `<provider>_` key prefix.
    pub fn provider<'a>(&'a mut self, provider: &str) -> Result<ConfigProvider<'a>, ConfigError> {
        ConfigProvider::new(self, provider)
    }

    /// Deterministic rendering of the expanded store.
    pub fn dump_expanded(&self) -> Result<String, ConfigError> {
        let mut expanded = BTreeMap::new();
        for (key, value) in &self.values {
            expanded.insert(key.clone(), self.expand_value(value)?);
        }
        Ok(dump::dump_values(&expanded))
    }

    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ConfigError> {
        for override_text in overrides {
            let parts: Vec<&str> = override_text.split('=').collect();
            if parts.len() != 2 {
                return Err(ConfigError::Override(override_text.clone()));
            }

            self.set(parts[0], Value::from(parts[1]));
        }

        Ok(())
    }

    pub fn merge_env_vars(&mut self) {
        for (name, value) in std::env::vars() {
            if let Some(key) = name.strip_prefix(ENV_VAR_PREFIX) {
                self.set(key, Value::Str(value));
            }
        }
    }

    pub fn read_config_string(&mut self, data: &str) -> Result<(), ConfigError> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(data)
            .map_err(|_| ConfigError::Format("config string is not valid YAML".to_string()))?;

        match Value::from_yaml(yaml) {
            Some(Value::Map(map)) => self.merge_docs(vec![map]),
            Some(_) => Err(ConfigError::Format(
                "config string should contain a valid YAML mapping".to_string(),
            )),
            None => Err(ConfigError::Load("<string>".to_string())),
        }
    }

    /// Read and merge a config file found on the search paths.
    ///
    /// The initial config is only looked for on the first search path;
    /// includes search all of them. When several paths hold the file, every
    /// hit merges, earlier paths last so they win.
    pub fn read_config_file(&mut self, file_name: &str, initial: bool) -> Result<(), ConfigError> {
        let docs = self.load_file_docs(file_name, initial)?;
        if initial {
            info!("loaded config: '{file_name}'");
        }
        self.merge_docs(docs)
    }

    fn load_file_docs(
        &self,
        file_name: &str,
        initial: bool,
    ) -> Result<Vec<BTreeMap<String, Value>>, ConfigError> {
        let path_list = if initial {
            &self.path_list[..1]
        } else {
            &self.path_list[..]
        };

        let mut docs = Vec::new();
        for full_name in get_path_names(file_name, path_list).iter().rev() {
            let Ok(text) = fs::read_to_string(full_name) else {
                continue;
            };

            let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|_| {
                ConfigError::Format(format!(
                    "config file should contain valid YAML: '{}'",
                    full_name.display()
                ))
            })?;

            match Value::from_yaml(yaml) {
                Some(Value::Map(map)) => docs.push(map),
                Some(_) => {
                    return Err(ConfigError::Format(format!(
                        "config file should contain a valid YAML mapping: '{}'",
                        full_name.display()
                    )))
                }
                // an empty document is the same as a missing one
                None => continue,
            }
        }

        if docs.is_empty() {
            return Err(ConfigError::Load(file_name.to_string()));
        }

        Ok(docs)
    }

    fn merge_docs(&mut self, docs: Vec<BTreeMap<String, Value>>) -> Result<(), ConfigError> {
        let mut include_lists = Vec::new();

        for mut doc in docs {
            let include = doc.remove("include");
            let include_optional = doc.remove("include_optional");

            for (key, value) in doc {
                self.values.insert(key, value);
            }

            include_lists.push((include, include_optional));
        }

        // includes merge after the including document, so they override it
        for (include, include_optional) in include_lists {
            if let Some(value) = include {
                self.read_includes(&value, false)?;
            }
            if let Some(value) = include_optional {
                self.read_includes(&value, true)?;
            }
        }

        Ok(())
    }

    fn read_includes(&mut self, value: &Value, optional: bool) -> Result<(), ConfigError> {
        let Value::List(items) = value else {
            return Err(ConfigError::Format(
                "config file includes should contain a valid YAML list".to_string(),
            ));
        };

        for item in items {
            let Value::Str(raw_name) = item else {
                return Err(ConfigError::Format(
                    "config file include entries should be strings".to_string(),
                ));
            };

            let file_name = self.expand_str(raw_name)?;
            match self.read_config_file(&file_name, false) {
                Ok(()) => info!("included config: '{file_name}'"),
                Err(ConfigError::Load(_)) if optional => {
                    debug!("skipped optional config: '{file_name}'");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

impl ConfigView for Config {
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        match self.values.get(key) {
            Some(value) => Ok(Some(self.expand_value(value)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn expand_value(&self, value: &Value) -> Result<Value, ConfigError> {
        match value {
            Value::Str(s) => Ok(Value::Str(self.expand_str(s)?)),
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.expand_value(item))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), self.expand_value(value)?)))
                    .collect::<Result<_, ConfigError>>()?,
            )),
            scalar => Ok(scalar.clone()),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&dump::dump_values(&self.values))
    }
}

/// A view over [`Config`] under a `<provider>_` key prefix.
///
/// Reads fall back to the unprefixed key; writes never do.
pub struct ConfigProvider<'a> {
    config: &'a mut Config,
    prefix: String,
}

impl<'a> ConfigProvider<'a> {
    pub fn new(config: &'a mut Config, provider: &str) -> Result<Self, ConfigError> {
        if provider.is_empty() {
            return Err(ConfigError::ProviderName);
        }

        Ok(ConfigProvider {
            config,
            prefix: format!("{provider}_"),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let target = if key.starts_with(&self.prefix) {
            key.to_string()
        } else {
            self.prefixed(key)
        };
        self.config.set(&target, value);
    }

    pub fn set_opt(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(value) => self.set(key, value),
            None => {
                let target = if key.starts_with(&self.prefix) {
                    key.to_string()
                } else {
                    self.prefixed(key)
                };
                self.config.delete(&target);
            }
        }
    }

    /// Delete both the prefixed key and the bare key.
    pub fn delete(&mut self, key: &str) {
        if !key.starts_with(&self.prefix) {
            let prefixed = self.prefixed(key);
            self.config.delete(&prefixed);
        }
        self.config.delete(key);
    }
}

impl ConfigView for ConfigProvider<'_> {
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        if !key.starts_with(&self.prefix) {
            if let Some(value) = self.config.get(&self.prefixed(key))? {
                return Ok(Some(value));
            }
        }

        self.config.get(key)
    }

    fn contains(&self, key: &str) -> bool {
        if key.starts_with(&self.prefix) {
            self.config.contains(key)
        } else {
            self.config.contains(&self.prefixed(key)) || self.config.contains(key)
        }
    }

    fn expand_value(&self, value: &Value) -> Result<Value, ConfigError> {
        self.config.expand_value(value)
    }
}
