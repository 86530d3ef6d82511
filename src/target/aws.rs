//! AWS build target.
//!
//! Strategy order: a catalog-installed or pre-referenced vagrant box is
//! repackaged and its Vagrantfile scanned for the source AMI id, otherwise
//! a directly supplied `aws_ami_id` is used as-is. The amazon-ebs builder
//! section is bound from the provider view, then the flat volume
//! parameters are folded into block-device mappings.

use super::{
    export_box_from_config, extract_box_archive, install_box_from_config, set_provider_value,
    TargetContext,
};
use crate::config::{ConfigProvider, ConfigView, ValueKind};
use crate::packer::PackerDocument;
use crate::params::{parse_parameters, TargetParameter};
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::fs;
use std::path::Path;
use tracing::info;

pub fn build(ctx: &mut TargetContext<'_>) -> Result<()> {
    let TargetContext {
        config,
        packer,
        scratch,
        inventory,
    } = ctx;

    let mut config = config.provider("aws")?;

    install_box_from_config(&config, inventory, "aws")?;

    if let Some(archive) = export_box_from_config(&config, inventory, "aws", scratch)? {
        set_provider_value(
            &mut config,
            "aws_vagrant_box_file",
            Some(archive.display().to_string()),
        );
    }

    build_from_vagrant_box_file(&mut config, scratch)?;

    if !build_from_ami_id(&config, packer)? {
        bail!("no build strategy satisfiable: set vagrant_box_name, aws_vagrant_box_file or aws_ami_id");
    }

    Ok(())
}

fn build_from_vagrant_box_file(config: &mut ConfigProvider<'_>, scratch: &Path) -> Result<()> {
    let Some(box_file) = config.get_str("aws_vagrant_box_file")? else {
        return Ok(());
    };

    info!("extracting AWS Vagrantfile from vagrant box");

    let entries = extract_box_archive(&box_file, scratch)?;
    let vagrantfile = entries
        .get("Vagrantfile")
        .with_context(|| format!("no Vagrantfile found in vagrant box '{box_file}'"))?;

    let ami_id = parse_vagrantfile_for_ami_id(vagrantfile)?;
    set_provider_value(config, "aws_ami_id", Some(ami_id));

    Ok(())
}

/// Scan an exported Vagrantfile for the `ami: "<id>"` setting.
fn parse_vagrantfile_for_ami_id(file_name: &Path) -> Result<String> {
    let text = fs::read_to_string(file_name)
        .with_context(|| format!("reading Vagrantfile '{}'", file_name.display()))?;

    let ami_re = Regex::new(r#"ami:\s*"([^"]+)""#).expect("static regex");
    for line in text.lines() {
        if let Some(captures) = ami_re.captures(line) {
            return Ok(captures[1].to_string());
        }
    }

    bail!("unable to extract AWS AMI id from vagrant box file")
}

fn ebs_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("aws_access_key")
            .output("access_key")
            .with_default("(( env|AWS_ACCESS_KEY_ID ))"),
        TargetParameter::new("aws_secret_key")
            .output("secret_key")
            .with_default("(( env|AWS_SECRET_ACCESS_KEY ))"),
        TargetParameter::new("aws_session_token")
            .output("token")
            .with_default("(( env|AWS_SESSION_TOKEN ))"),
        TargetParameter::new("aws_region")
            .output("region")
            .with_default("(( env|AWS_DEFAULT_REGION ))"),
        TargetParameter::new("aws_subnet_id").output("subnet_id").optional(),
        TargetParameter::new("aws_ami_id").output("source_ami"),
        TargetParameter::new("aws_ami_name")
            .output("ami_name")
            .with_default("packermate {{ isotime \"2006-01-02 15-04\" }}"),
        TargetParameter::new("aws_ami_force_deregister")
            .output("force_deregister")
            .kind(ValueKind::Bool)
            .with_default(false),
        TargetParameter::new("aws_instance_type").output("instance_type"),
        TargetParameter::new("ssh_user").output("ssh_username"),
        TargetParameter::new("ssh_key_file")
            .output("ssh_private_key_file")
            .optional(),
        TargetParameter::new("aws_keypair_name")
            .output("ssh_keypair_name")
            .optional(),
        TargetParameter::new("aws_disk_gb")
            .output("volume_size")
            .kind(ValueKind::Int)
            .optional(),
        TargetParameter::new("aws_disk_type").output("volume_type").optional(),
        TargetParameter::new("aws_ami_tags")
            .output("tags")
            .kind(ValueKind::Map)
            .optional(),
        TargetParameter::new("aws_ami_builder_tags")
            .output("run_tags")
            .kind(ValueKind::Map)
            .optional(),
        TargetParameter::new("aws_iam_instance_profile")
            .output("iam_instance_profile")
            .optional(),
    ]
}

fn build_from_ami_id(config: &ConfigProvider<'_>, packer: &mut PackerDocument) -> Result<bool> {
    if !config.contains("aws_ami_id") {
        return Ok(false);
    }

    info!("configuring AWS AMI build");

    let mut ebs_build = serde_json::Map::new();
    ebs_build.insert(
        "type".to_string(),
        JsonValue::String("amazon-ebs".to_string()),
    );

    parse_parameters(&ebs_params(), config, &mut ebs_build, None)
        .context("binding amazon-ebs parameters")?;

    apply_block_device_mappings(&mut ebs_build);

    packer.add_builder(JsonValue::Object(ebs_build));

    Ok(true)
}

/// Fold the flat volume parameters into root-partition block device
/// mappings.
fn apply_block_device_mappings(output: &mut serde_json::Map<String, JsonValue>) {
    for key in ["volume_size", "volume_type"] {
        let Some(value) = output.remove(key) else {
            continue;
        };

        for mapping_key in ["ami_block_device_mappings", "launch_block_device_mappings"] {
            let mappings = output.entry(mapping_key).or_insert_with(|| {
                json!([{
                    "device_name": "/dev/sda1",
                    "delete_on_termination": true,
                }])
            });

            if let Some(first) = mappings.as_array_mut().and_then(|list| list.first_mut()) {
                if let Some(first) = first.as_object_mut() {
                    first.insert(key.to_string(), value.clone());
                }
            }
        }
    }
}
