//! Declarative parameter binding.
//!
//! Every builder target and the provisioner parser project configuration
//! keys into the output document through the same binding machinery: an
//! ordered list of [`TargetParameter`]s applied against one configuration
//! view and one output object, with per-call overrides, defaults, kind
//! checks, transforms and conditional inclusion.

use crate::config::{ConfigError, ConfigView, Value, ValueKind};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BindError {
    #[error("missing required config key: {0}")]
    MissingRequired(String),

    #[error("parameter type mismatch: name={key} expected={expected} received={received}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        received: ValueKind,
    },

    #[error(transparent)]
    Expand(#[from] ConfigError),
}

pub type Transform = fn(&Value) -> Value;

/// One source-key-to-destination-key binding.
pub struct TargetParameter {
    pub config_key: &'static str,
    pub output_key: &'static str,
    pub required: bool,
    pub kind: ValueKind,
    pub default: Option<Value>,
    pub only_if: Option<&'static str>,
    pub transform: Option<Transform>,
}

impl TargetParameter {
    pub fn new(config_key: &'static str) -> TargetParameter {
        TargetParameter {
            config_key,
            output_key: config_key,
            required: true,
            kind: ValueKind::Str,
            default: None,
            only_if: None,
            transform: None,
        }
    }

    pub fn output(mut self, output_key: &'static str) -> Self {
        self.output_key = output_key;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Discard this binding's output when `output_key` is absent from the
    /// final document.
    pub fn only_if(mut self, output_key: &'static str) -> Self {
        self.only_if = Some(output_key);
        self
    }

    /// Post-process the bound value; the result is expanded again.
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Apply a binding list against a configuration view.
///
/// Values resolve from the per-call overrides, then the view, then the
/// declared default. A second pass removes outputs whose `only_if`
/// dependency is absent and then enforces `required`.
pub fn parse_parameters(
    params: &[TargetParameter],
    config: &dyn ConfigView,
    output: &mut serde_json::Map<String, serde_json::Value>,
    overrides: Option<&BTreeMap<String, Value>>,
) -> Result<(), BindError> {
    for param in params {
        let value = if let Some(raw) = overrides.and_then(|lookup| lookup.get(param.config_key)) {
            Some(config.expand_value(raw)?)
        } else if config.contains(param.config_key) {
            config.get(param.config_key)?
        } else if let Some(default) = &param.default {
            Some(config.expand_value(default)?)
        } else {
            None
        };

        let Some(mut value) = value else {
            continue;
        };

        if value.kind() != param.kind {
            return Err(BindError::TypeMismatch {
                key: param.config_key.to_string(),
                expected: param.kind,
                received: value.kind(),
            });
        }

        if let Some(transform) = param.transform {
            value = config.expand_value(&transform(&value))?;
        }

        output.insert(param.output_key.to_string(), value.to_json());
    }

    for param in params {
        let gate_fired = match param.only_if {
            Some(dependency) => {
                output.contains_key(param.output_key) && !output.contains_key(dependency)
            }
            None => false,
        };

        if gate_fired {
            output.remove(param.output_key);
        } else if param.required && !output.contains_key(param.output_key) {
            return Err(BindError::MissingRequired(param.config_key.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn config_simple() -> Config {
        Config::from_string("---\nkey1: val1\nlist1:\n- val2\n- val3\n").unwrap()
    }

    fn bind(
        params: &[TargetParameter],
        overrides: Option<&BTreeMap<String, Value>>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, BindError> {
        let config = config_simple();
        let mut output = serde_json::Map::new();
        parse_parameters(params, &config, &mut output, overrides)?;
        Ok(output)
    }

    fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let result = bind(&[TargetParameter::new("key2")], None);
        assert!(matches!(result, Err(BindError::MissingRequired(key)) if key == "key2"));

        let result = bind(&[TargetParameter::new("key2").output("out2")], None);
        assert!(result.is_err());
    }

    #[test]
    fn binds_present_keys() {
        let output = bind(&[TargetParameter::new("key1")], None).unwrap();
        assert_eq!(output, object(json!({"key1": "val1"})));

        let output = bind(&[TargetParameter::new("key1").output("out1")], None).unwrap();
        assert_eq!(output, object(json!({"out1": "val1"})));
    }

    #[test]
    fn optional_missing_key_binds_nothing() {
        let output = bind(
            &[TargetParameter::new("key2").output("out2").optional()],
            None,
        )
        .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let output = bind(
            &[TargetParameter::new("key2").output("out2").with_default("val4")],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out2": "val4"})));

        // defaults are expanded
        let output = bind(
            &[TargetParameter::new("key2")
                .output("out2")
                .with_default("(( key1 ))")],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out2": "val1"})));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let result = bind(
            &[TargetParameter::new("key1").output("out1").kind(ValueKind::List)],
            None,
        );
        assert!(matches!(result, Err(BindError::TypeMismatch { .. })));
    }

    #[test]
    fn list_values_bind_as_lists() {
        let output = bind(
            &[TargetParameter::new("list1").output("out3").kind(ValueKind::List)],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out3": ["val2", "val3"]})));

        let output = bind(
            &[TargetParameter::new("list2")
                .output("out4")
                .kind(ValueKind::List)
                .with_default(Vec::<Value>::new())],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out4": []})));
    }

    #[test]
    fn only_if_discards_when_dependency_absent() {
        let output = bind(
            &[
                TargetParameter::new("key1").output("out1").only_if("out2"),
                TargetParameter::new("key2").output("out2").optional(),
            ],
            None,
        )
        .unwrap();
        assert!(output.is_empty());

        let output = bind(
            &[
                TargetParameter::new("key1").output("out1").only_if("out2"),
                TargetParameter::new("key2").output("out2").with_default("val4"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out1": "val1", "out2": "val4"})));
    }

    #[test]
    fn overrides_win_over_config_and_defaults() {
        let overrides = BTreeMap::from([("key2".to_string(), Value::from("val4"))]);

        let output = bind(
            &[
                TargetParameter::new("key1").output("out1").only_if("out2"),
                TargetParameter::new("key2").output("out2"),
            ],
            Some(&overrides),
        )
        .unwrap();
        assert_eq!(output, object(json!({"out1": "val1", "out2": "val4"})));

        let output = bind(
            &[TargetParameter::new("key2").output("out2").with_default("val5")],
            Some(&overrides),
        )
        .unwrap();
        assert_eq!(output, object(json!({"out2": "val4"})));
    }

    #[test]
    fn transforms_rewrite_bound_values() {
        let output = bind(
            &[TargetParameter::new("key1")
                .output("out1")
                .transform(|_| Value::from("val4"))],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out1": "val4"})));

        // a transform never runs without a value
        let result = bind(
            &[TargetParameter::new("key2")
                .output("out2")
                .transform(|_| Value::from("val4"))],
            None,
        );
        assert!(result.is_err());

        // transform results are expanded
        let output = bind(
            &[TargetParameter::new("key2")
                .output("out2")
                .with_default("val4")
                .transform(|_| Value::from("(( key1 ))"))],
            None,
        )
        .unwrap();
        assert_eq!(output, object(json!({"out2": "val1"})));
    }
}
