//! Platform build targets.
//!
//! Each target walks a fixed priority order of mutually exclusive build
//! strategies (installer image, local box archive, catalog install and
//! export, direct machine identifier) and populates the build document's
//! builder section through the parameter binder. A target that ends the
//! walk with nothing to build aborts before the external tool ever runs.

pub mod aws;
pub mod virtualbox;

use crate::config::{Config, ConfigProvider, ConfigView, Value};
use crate::files::unarchive_file;
use crate::inventory::BoxInventory;
use crate::packer::PackerDocument;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Shared collaborators for one target build.
pub struct TargetContext<'a> {
    pub config: &'a mut Config,
    pub packer: &'a mut PackerDocument,
    pub scratch: &'a Path,
    pub inventory: &'a BoxInventory,
}

/// Run the named target.
pub fn build_target(name: &str, ctx: &mut TargetContext<'_>) -> Result<()> {
    match name {
        "virtualbox" => virtualbox::build(ctx).context("building virtualbox target"),
        "aws" => aws::build(ctx).context("building aws target"),
        other => bail!("unknown target: {other}"),
    }
}

/// Install the configured box into the local inventory if missing.
pub(crate) fn install_box_from_config(
    config: &ConfigProvider<'_>,
    inventory: &BoxInventory,
    provider: &str,
) -> Result<()> {
    if !config.contains("vagrant_box_name") {
        return Ok(());
    }

    let box_name = config
        .get_str("vagrant_box_name")?
        .unwrap_or_default();
    let box_url = match config.get_str("vagrant_box_url")? {
        Some(url) if !url.is_empty() => url,
        _ => box_name.clone(),
    };
    let box_version = config.get_str("vagrant_box_version")?;
    let box_version = box_version.as_deref().filter(|v| !v.is_empty());

    info!(
        "checking for local vagrant box: {box_name} {}",
        box_version.unwrap_or("")
    );

    if inventory.installed(&box_name, provider, box_version)?.is_none() {
        info!(
            "installing vagrant box: {box_url} {}",
            box_version.unwrap_or("")
        );
        inventory.install(&box_url, provider, box_version)?;
    }

    Ok(())
}

/// Repackage the configured box into the scratch dir, returning the
/// archive path, or `None` when no box is configured.
pub(crate) fn export_box_from_config(
    config: &ConfigProvider<'_>,
    inventory: &BoxInventory,
    provider: &str,
    scratch: &Path,
) -> Result<Option<PathBuf>> {
    if !config.contains("vagrant_box_name") {
        return Ok(None);
    }

    let box_name = config
        .get_str("vagrant_box_name")?
        .unwrap_or_default();

    let box_version = match config.get_str("vagrant_box_version")? {
        Some(version) if !version.is_empty() => Some(crate::version::Version::parse(&version)?),
        _ => inventory.installed(&box_name, provider, None)?,
    };

    let Some(box_version) = box_version else {
        bail!("vagrant box is not installed: name={box_name} provider={provider}");
    };

    let archive = inventory.export(scratch, &box_name, provider, box_version)?;
    Ok(Some(archive))
}

/// Extract a box archive into the scratch dir, mapping entry names to
/// their paths.
pub(crate) fn extract_box_archive(
    archive_name: &str,
    scratch: &Path,
) -> Result<BTreeMap<String, PathBuf>> {
    info!("extracting vagrant box: {archive_name}");
    Ok(unarchive_file(Path::new(archive_name), scratch)?)
}

pub(crate) fn set_provider_value(
    config: &mut ConfigProvider<'_>,
    key: &str,
    value: Option<String>,
) {
    config.set_opt(key, value.map(Value::from));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_is_an_error() {
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

        assert!(build_target("unknown", &mut ctx).is_err());
    }
}
