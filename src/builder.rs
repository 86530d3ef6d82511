//! Build orchestration.
//!
//! Sequences the targets into a build document inside a scratch
//! directory, validates it with the external tool, runs the build unless
//! dry-run, then drives publishing. The scratch directory is removed on
//! every exit path.

use crate::config::{Config, ConfigView};
use crate::files::Scratch;
use crate::inventory::BoxInventory;
use crate::packer::PackerDocument;
use crate::process::{run_command, ProcessError};
use crate::provisioner::{parse_provisioners, parse_vagrant_export};
use crate::publish::publish_box;
use crate::target::{build_target, TargetContext};
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;

#[derive(Debug, Default)]
pub struct BuildOptions {
    pub dry_run: bool,
    pub dump_packer: bool,
}

/// Run the whole build for the selected targets.
pub fn run_build(config: &mut Config, targets: &[&str], options: &BuildOptions) -> Result<()> {
    let mut packer = PackerDocument::new();

    let temp_root = config.get_str("temp_dir")?;
    let scratch = Scratch::new(temp_root.as_deref().map(Path::new))
        .context("creating scratch directory")?;

    let vagrant_command = config
        .get_str("vagrant_command")?
        .context("no vagrant command set")?;
    let inventory = BoxInventory::new(&vagrant_command);

    for target_name in targets {
        let mut ctx = TargetContext {
            config: &mut *config,
            packer: &mut packer,
            scratch: scratch.path(),
            inventory: &inventory,
        };
        build_target(target_name, &mut ctx)?;
    }

    if let Some(provisioner_list) = config.raw("provisioners").cloned() {
        parse_provisioners(&provisioner_list, config, &mut packer)
            .context("parsing provisioners")?;
    }

    parse_vagrant_export(config, &mut packer).context("parsing vagrant export")?;

    if options.dump_packer {
        let dump_file_name = packer
            .write(None)
            .context("dumping packer configuration")?;
        info!(
            "dumped packer configuration to '{}'",
            dump_file_name.display()
        );
    }

    let packer_file_name = validate_packer(config, &packer, scratch.path())?;

    if !options.dry_run {
        run_packer_build(config, &packer_file_name)?;

        info!("build complete");

        publish_box(config, targets, &inventory)?;
    }

    Ok(())
}

fn packer_command(config: &Config) -> Result<String> {
    match config.get_str("packer_command")? {
        Some(command) if !command.is_empty() => Ok(command),
        _ => bail!("no packer command set"),
    }
}

/// Write the document into the scratch dir and have the external tool
/// validate it.
fn validate_packer(config: &Config, packer: &PackerDocument, scratch: &Path) -> Result<String> {
    let command = packer_command(config)?;

    let file_name = packer
        .write(Some(scratch))
        .context("writing packer configuration")?;
    let file_name = file_name.display().to_string();

    info!("validating packer configuration");
    match run_command(&command, &["validate", &file_name], true, None) {
        Ok(_) => Ok(file_name),
        Err(ProcessError::Failed { stdout, .. }) => {
            bail!("failed to validate packer configuration:\n{stdout}")
        }
        Err(err) => bail!("failed to validate packer configuration: {err}"),
    }
}

fn run_packer_build(config: &Config, packer_file_name: &str) -> Result<()> {
    let command = packer_command(config)?;

    info!("building packer configuration");
    run_command(&command, &["build", packer_file_name], false, None)
        .map(|_| ())
        .context("failed to build packer configuration")
}
