//! VirtualBox build target.
//!
//! Strategy order: an installer ISO URL builds an installer-driven
//! configuration (writing an unattended-install preseed into the scratch
//! dir), otherwise a local or catalog-installed vagrant box is repackaged
//! and its OVF/OVA fed into an import build.

use super::{
    export_box_from_config, extract_box_archive, install_box_from_config, set_provider_value,
    TargetContext,
};
use crate::config::{ConfigProvider, ConfigView, Value, ValueKind};
use crate::packer::PackerDocument;
use crate::params::{parse_parameters, TargetParameter};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value as JsonValue};
use std::fs;
use std::path::Path;
use tracing::info;

const PRESEED_FILE_NAME: &str = "preseed.cfg";
const PRESEED_TEMPLATE: &str = include_str!("../../templates/preseed.cfg");

const DEFAULT_BOOT_COMMAND: &[&str] = &[
    "<esc><esc><enter><wait>",
    "/install/vmlinuz noapic preseed/url=http://{{ .HTTPIP }}:{{ .HTTPPort }}/preseed.cfg <wait>",
    "debian-installer=en_GB auto locale=en_GB kbd-chooser/method=gb <wait>",
    "hostname={{ .Name }} <wait>",
    "fb=false debconf/frontend=noninteractive <wait>",
    "keyboard-configuration/modelcode=SKIP keyboard-configuration/layout=GB keyboard-configuration/variant=GB console-setup/ask_detect=false <wait>",
    "initrd=/install/initrd.gz -- <enter><wait>",
];

/// Replace machine-name-hostile characters.
fn to_machine_name(value: &Value) -> Value {
    match value {
        Value::Str(name) => Value::Str(name.replace(['_', '.'], "-")),
        other => other.clone(),
    }
}

pub fn build(ctx: &mut TargetContext<'_>) -> Result<()> {
    let TargetContext {
        config,
        packer,
        scratch,
        inventory,
    } = ctx;

    let mut config = config.provider("virtualbox")?;

    if config.is_truthy("virtualbox_iso_url")? {
        info!("configuring ISO build");
        build_iso(&config, packer, scratch)?;
        return Ok(());
    }

    info!("configuring OVF/OVA build");

    install_box_from_config(&config, inventory, "virtualbox")?;

    // a pre-referenced archive survives when no catalog box is configured
    if let Some(archive) = export_box_from_config(&config, inventory, "virtualbox", scratch)? {
        set_provider_value(
            &mut config,
            "virtualbox_vagrant_box_file",
            Some(archive.display().to_string()),
        );
    }

    build_from_vagrant_box_file(&mut config, scratch)?;

    if !build_from_input_file(&config, packer)? {
        bail!("no build strategy satisfiable: set virtualbox_iso_url, virtualbox_vagrant_box_file, vagrant_box_name or virtualbox_input_file");
    }

    Ok(())
}

fn iso_params() -> Vec<TargetParameter> {
    let boot_command: Vec<Value> = DEFAULT_BOOT_COMMAND
        .iter()
        .map(|line| Value::from(*line))
        .collect();

    vec![
        TargetParameter::new("virtualbox_output_name")
            .output("vm_name")
            .transform(to_machine_name),
        TargetParameter::new("virtualbox_iso_url").output("iso_url"),
        TargetParameter::new("virtualbox_iso_checksum").output("iso_checksum"),
        TargetParameter::new("virtualbox_iso_checksum_type")
            .output("iso_checksum_type")
            .with_default("md5"),
        TargetParameter::new("virtualbox_guest_os_type")
            .output("guest_os_type")
            .with_default("Ubuntu_64"),
        TargetParameter::new("virtualbox_disk_mb")
            .output("disk_size")
            .optional(),
        TargetParameter::new("ssh_user").output("ssh_username"),
        TargetParameter::new("ssh_password").output("ssh_password"),
        TargetParameter::new("virtualbox_shutdown_command")
            .output("shutdown_command")
            .with_default("echo '(( ssh_password ))' | sudo -S shutdown -P now"),
        TargetParameter::new("virtualbox_output_directory").output("output_directory"),
        TargetParameter::new("virtualbox_output_format")
            .output("format")
            .optional(),
        TargetParameter::new("virtualbox_packer_http_dir")
            .output("http_directory")
            .with_default("packer_http"),
        TargetParameter::new("virtualbox_headless")
            .output("headless")
            .kind(ValueKind::Bool)
            .with_default(true),
        TargetParameter::new("virtualbox_boot_command")
            .output("boot_command")
            .kind(ValueKind::List)
            .with_default(boot_command),
    ]
}

fn build_iso(
    config: &ConfigProvider<'_>,
    packer: &mut PackerDocument,
    scratch: &Path,
) -> Result<()> {
    let mut iso_build = serde_json::Map::new();
    iso_build.insert(
        "type".to_string(),
        JsonValue::String("virtualbox-iso".to_string()),
    );

    parse_parameters(&iso_params(), config, &mut iso_build, None)
        .context("binding virtualbox-iso parameters")?;

    // pass vboxmanage tuning straight through as modifyvm rows
    let mut vboxmanage = Vec::new();
    for (config_key, vboxmanage_flag) in
        [("virtualbox_memory_mb", "--memory"), ("virtualbox_cpus", "--cpus")]
    {
        if config.contains(config_key) {
            if let Some(value) = config.get_str(config_key)? {
                vboxmanage.push(json!(["modifyvm", "{{ .Name }}", vboxmanage_flag, value]));
            }
        }
    }
    if !vboxmanage.is_empty() {
        iso_build.insert("vboxmanage".to_string(), JsonValue::Array(vboxmanage));
    }

    write_iso_preseed(&mut iso_build, scratch)?;

    packer.add_builder(JsonValue::Object(iso_build));

    Ok(())
}

/// Write the unattended-install answer file into the scratch http
/// directory and point the builder at it.
fn write_iso_preseed(
    output: &mut serde_json::Map<String, JsonValue>,
    scratch: &Path,
) -> Result<()> {
    let http_dir = output
        .get("http_directory")
        .and_then(JsonValue::as_str)
        .context("http_directory missing from ISO build")?
        .to_string();

    let http_path = scratch.join(&http_dir);
    fs::create_dir(&http_path)
        .with_context(|| format!("creating http directory '{}'", http_path.display()))?;
    output.insert(
        "http_directory".to_string(),
        JsonValue::String(http_path.display().to_string()),
    );

    let user_account = output
        .get("ssh_username")
        .and_then(JsonValue::as_str)
        .context("ssh_username missing from ISO build")?;
    let user_password = output
        .get("ssh_password")
        .and_then(JsonValue::as_str)
        .context("ssh_password missing from ISO build")?;

    let preseed_text = PRESEED_TEMPLATE
        .replace("${user_account}", user_account)
        .replace("${user_password}", user_password);

    let preseed_file_name = http_path.join(PRESEED_FILE_NAME);
    fs::write(&preseed_file_name, preseed_text)
        .with_context(|| format!("writing preseed '{}'", preseed_file_name.display()))?;

    Ok(())
}

fn build_from_vagrant_box_file(config: &mut ConfigProvider<'_>, scratch: &Path) -> Result<()> {
    let Some(box_file) = config.get_str("virtualbox_vagrant_box_file")? else {
        return Ok(());
    };

    info!("extracting VirtualBox OVF/OVA file from vagrant box");

    let entries = extract_box_archive(&box_file, scratch)?;
    let input_file = entries
        .get("box.ovf")
        .or_else(|| entries.get("box.ova"))
        .map(|path| path.display().to_string());

    set_provider_value(config, "virtualbox_input_file", input_file);

    Ok(())
}

fn ovf_params() -> Vec<TargetParameter> {
    vec![
        TargetParameter::new("virtualbox_output_name")
            .output("vm_name")
            .transform(to_machine_name),
        TargetParameter::new("ssh_user").output("ssh_username"),
        TargetParameter::new("ssh_password").output("ssh_password").optional(),
        TargetParameter::new("ssh_key_file")
            .output("ssh_private_key_file")
            .optional(),
        TargetParameter::new("virtualbox_input_file").output("source_path"),
        TargetParameter::new("virtualbox_output_directory").output("output_directory"),
        TargetParameter::new("virtualbox_headless")
            .output("headless")
            .kind(ValueKind::Bool)
            .with_default(true),
    ]
}

fn build_from_input_file(
    config: &ConfigProvider<'_>,
    packer: &mut PackerDocument,
) -> Result<bool> {
    if !config.contains("virtualbox_input_file") {
        return Ok(false);
    }

    info!("building from VirtualBox OVF/OVA file");

    let mut ovf_build = serde_json::Map::new();
    ovf_build.insert(
        "type".to_string(),
        JsonValue::String("virtualbox-ovf".to_string()),
    );

    parse_parameters(&ovf_params(), config, &mut ovf_build, None)
        .context("binding virtualbox-ovf parameters")?;

    packer.add_builder(JsonValue::Object(ovf_build));

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::inventory::BoxInventory;
    use crate::packer::PackerDocument;

    fn iso_config() -> Config {
        Config::from_string(
            "---
virtualbox_output_name: test_vm.example
virtualbox_iso_url: http://example.com/install.iso
virtualbox_iso_checksum: abc123
virtualbox_output_directory: output
virtualbox_memory_mb: 1024
ssh_user: vagrant
ssh_password: secret
",
        )
        .unwrap()
    }

    #[test]
    fn iso_strategy_builds_installer_configuration() {
        let mut config = iso_config();
        let mut packer = PackerDocument::new();
        let scratch = tempfile::tempdir().unwrap();
        let inventory = BoxInventory::new("vagrant");

        let mut ctx = TargetContext {
            config: &mut config,
            packer: &mut packer,
            scratch: scratch.path(),
            inventory: &inventory,
        };
        build(&mut ctx).unwrap();

        let builders = &packer.to_json()["builders"];
        assert_eq!(builders[0]["type"], "virtualbox-iso");
        assert_eq!(builders[0]["vm_name"], "test-vm-example");
        assert_eq!(builders[0]["iso_checksum_type"], "md5");
        assert_eq!(builders[0]["guest_os_type"], "Ubuntu_64");
        assert_eq!(builders[0]["headless"], true);
        assert_eq!(
            builders[0]["shutdown_command"],
            "echo 'secret' | sudo -S shutdown -P now"
        );
        assert_eq!(
            builders[0]["vboxmanage"],
            json!([["modifyvm", "{{ .Name }}", "--memory", "1024"]])
        );

        // the preseed lands inside the scratch http directory
        let http_directory = builders[0]["http_directory"].as_str().unwrap();
        assert!(http_directory.starts_with(scratch.path().to_str().unwrap()));
        let preseed = fs::read_to_string(Path::new(http_directory).join(PRESEED_FILE_NAME)).unwrap();
        assert!(preseed.contains("d-i passwd/username string vagrant"));
        assert!(preseed.contains("d-i passwd/user-password password secret"));
    }

    #[test]
    fn input_file_strategy_builds_ovf_configuration() {
        let mut config = Config::from_string(
            "---
virtualbox_output_name: test_vm
virtualbox_input_file: /tmp/box.ovf
virtualbox_output_directory: output
ssh_user: vagrant
",
        )
        .unwrap();
        let mut packer = PackerDocument::new();
        let scratch = tempfile::tempdir().unwrap();
        let inventory = BoxInventory::new("vagrant");

        let mut ctx = TargetContext {
            config: &mut config,
            packer: &mut packer,
            scratch: scratch.path(),
            inventory: &inventory,
        };
        build(&mut ctx).unwrap();

        let builders = &packer.to_json()["builders"];
        assert_eq!(builders[0]["type"], "virtualbox-ovf");
        assert_eq!(builders[0]["vm_name"], "test-vm");
        assert_eq!(builders[0]["source_path"], "/tmp/box.ovf");
        assert!(builders[0].get("ssh_password").is_none());
    }

    #[test]
    fn no_strategy_is_a_build_error() {
        let mut config = Config::from_string("---\nkey1: val1\n").unwrap();
        let mut packer = PackerDocument::new();
        let scratch = tempfile::tempdir().unwrap();
        let inventory = BoxInventory::new("vagrant");

        let mut ctx = TargetContext {
            config: &mut config,
            packer: &mut packer,
            scratch: scratch.path(),
            inventory: &inventory,
        };
        let err = build(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("no build strategy satisfiable"));
    }
}
