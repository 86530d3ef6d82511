//! Provisioner list validation and projection.
//!
//! Each entry in the `provisioners` config key names a recognized
//! provisioner type and is projected into the build document through the
//! parameter binder, with the entry's own keys acting as per-call
//! overrides.

use crate::config::{Config, Value, ValueKind};
use crate::packer::PackerDocument;
use crate::params::{parse_parameters, TargetParameter};
use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;

fn file_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("source"),
        TargetParameter::new("destination"),
        TargetParameter::new("direction").optional(),
    ]
}

fn shell_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("inline").kind(ValueKind::List).optional(),
        TargetParameter::new("script").optional(),
        TargetParameter::new("scripts").kind(ValueKind::List).optional(),
        TargetParameter::new("execute_command")
            .optional()
            .with_default("(( shell_command ))"),
        TargetParameter::new("environment_vars").kind(ValueKind::List).optional(),
    ]
}

fn shell_local_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("command"),
        TargetParameter::new("execute_command")
            .kind(ValueKind::List)
            .optional()
            .with_default(vec![
                Value::from("/bin/sh"),
                Value::from("-c"),
                Value::from("{{.Command}}"),
            ]),
    ]
}

fn ansible_local_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("playbook_file"),
        TargetParameter::new("playbook_dir").optional(),
        TargetParameter::new("command").optional(),
        TargetParameter::new("extra_arguments").kind(ValueKind::List).optional(),
        TargetParameter::new("extra_vars")
            .kind(ValueKind::Map)
            .optional()
            .transform(to_json_string),
    ]
}

/// Serialize a mapping to compact JSON for command-line interpolation.
fn to_json_string(value: &Value) -> Value {
    match serde_json::to_string(&value.to_json()) {
        Ok(text) => Value::Str(text),
        Err(_) => value.clone(),
    }
}

/// Fold the serialized `extra_vars` into `extra_arguments`.
fn finish_ansible_local(output: &mut serde_json::Map<String, JsonValue>) {
    let Some(JsonValue::String(extra_vars)) = output.remove("extra_vars") else {
        return;
    };

    let arguments = output
        .entry("extra_arguments")
        .or_insert_with(|| JsonValue::Array(Vec::new()));
    if let JsonValue::Array(arguments) = arguments {
        arguments.push(JsonValue::String(format!("-e '{extra_vars}'")));
    }
}

/// Project the raw `provisioners` list into the build document.
pub fn parse_provisioners(
    provisioner_list: &Value,
    config: &Config,
    packer: &mut PackerDocument,
) -> Result<()> {
    let Value::List(provisioner_list) = provisioner_list else {
        bail!("provisioners must be a list");
    };

    for provisioner in provisioner_list {
        let Value::Map(lookup) = provisioner else {
            bail!("provisioner entries must be mappings");
        };

        let provisioner_type = lookup
            .get("type")
            .and_then(Value::render)
            .unwrap_or_default();

        let params = match provisioner_type.as_str() {
            "file" => file_params(),
            "shell" => shell_params(),
            "shell-local" => shell_local_params(),
            "ansible-local" => ansible_local_params(),
            other => bail!("unknown provisioner type: {other}"),
        };

        let mut output = serde_json::Map::new();
        output.insert(
            "type".to_string(),
            JsonValue::String(provisioner_type.clone()),
        );

        parse_parameters(&params, config, &mut output, Some(lookup))
            .with_context(|| format!("parsing '{provisioner_type}' provisioner"))?;

        if provisioner_type == "ansible-local" {
            finish_ansible_local(&mut output);
        }

        packer.add_provisioner(JsonValue::Object(output));
    }

    Ok(())
}

/// Emit the vagrant export post-processor when requested.
pub fn parse_vagrant_export(config: &Config, packer: &mut PackerDocument) -> Result<()> {
    use crate::config::ConfigView;

    if !config.is_truthy("vagrant")? {
        return Ok(());
    }

    let mut vagrant_config = serde_json::Map::new();
    vagrant_config.insert("type".to_string(), JsonValue::String("vagrant".to_string()));

    if let Some(output) = config.get_str("vagrant_output")? {
        if !output.is_empty() {
            vagrant_config.insert("output".to_string(), JsonValue::String(output));
        }
    }

    if config.is_truthy("vagrant_keep_inputs")? {
        vagrant_config.insert("keep_input_artifact".to_string(), JsonValue::Bool(true));
    }

    packer.add_post_processor(JsonValue::Object(vagrant_config));

    Ok(())
}
