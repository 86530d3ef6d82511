//! Republishing built boxes to a versioned catalog.
//!
//! After a successful build the per-provider box files named by
//! `vagrant_output` are added to the box catalog under `vm_version`, with
//! download URLs and sha256 checksums, and the updated catalog document is
//! written next to the box files. An optional copy command runs for each
//! published file.

use crate::catalog::BoxCatalog;
use crate::config::{Config, ConfigView, Value};
use crate::files::sha256_sum;
use crate::inventory::BoxInventory;
use crate::process::run_shell;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CHECKSUM_TYPE: &str = "sha256";

/// Publish the built box files, if publishing is configured.
pub fn publish_box(config: &mut Config, targets: &[&str], inventory: &BoxInventory) -> Result<()> {
    if config.get_str("vagrant_output")?.unwrap_or_default().is_empty() {
        return Ok(());
    }

    let Some(vm_version) = config.get_str("vm_version")? else {
        info!("unable to publish vagrant version file as vm_version parameter not set");
        return Ok(());
    };

    let (catalog_file_name, target_files) = get_output_file_names(config, targets, true)?;

    let mut catalog = get_or_create_catalog(config, &catalog_file_name)?;

    add_files_to_catalog(config, &mut catalog, &vm_version, &target_files, inventory)?;

    info!("writing updated box catalog: {}", catalog_file_name.display());
    catalog
        .write(&catalog_file_name)
        .with_context(|| format!("writing box catalog '{}'", catalog_file_name.display()))?;

    if config.contains("vagrant_publish_copy_command") {
        copy_published_file(config, &catalog_file_name, None)?;
    }

    info!("publish complete");

    Ok(())
}

/// Resolve the catalog path and the per-target box file names from the
/// `vagrant_output` pattern.
fn get_output_file_names(
    config: &Config,
    targets: &[&str],
    check_files: bool,
) -> Result<(PathBuf, Vec<(String, PathBuf)>)> {
    let vagrant_output = config.get_str("vagrant_output")?.unwrap_or_default();

    let provider_re =
        Regex::new(r"^(.+)\{\{\s*\.Provider\s*\}\}(.+)$").expect("static regex");
    let Some(captures) = provider_re.captures(&vagrant_output) else {
        bail!("unable to determine vagrant box catalog output file name");
    };

    let vm_name = config
        .get_str("vm_name")?
        .context("vm_name parameter not set")?;

    let prefix = &captures[1];
    let suffix = &captures[2];

    let output_path = Path::new(prefix)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let catalog_file_name = output_path.join(format!("{vm_name}.json"));

    let mut target_files = Vec::new();
    for target_name in targets {
        let provider_file_name = PathBuf::from(format!("{prefix}{target_name}{suffix}"));

        if check_files && !provider_file_name.exists() {
            bail!(
                "unable to find vagrant box file: {}",
                provider_file_name.display()
            );
        }

        target_files.push((target_name.to_string(), provider_file_name));
    }

    if target_files.is_empty() {
        bail!("no vagrant box files found");
    }

    Ok((catalog_file_name, target_files))
}

/// Fetch the published catalog, fall back to the local file, else start a
/// fresh one.
fn get_or_create_catalog(config: &Config, catalog_file_name: &Path) -> Result<BoxCatalog> {
    let vm_name = config
        .get_str("vm_name")?
        .context("vm_name parameter not set")?;

    if let Some(url_prefix) = config.get_str("vagrant_publish_url_prefix")? {
        if !url_prefix.is_empty() {
            let catalog_url = format!("{url_prefix}{vm_name}.json");
            info!("attempting to retrieve box catalog: {catalog_url}");

            match BoxCatalog::load(&catalog_url) {
                Ok(catalog) => return Ok(catalog),
                Err(err) => warn!("failed to download box catalog: {catalog_url} ({err})"),
            }
        }
    }

    if catalog_file_name.exists() {
        let catalog_url = format!(
            "file://{}",
            std::fs::canonicalize(catalog_file_name)
                .unwrap_or_else(|_| catalog_file_name.to_path_buf())
                .display()
        );
        info!("loading box catalog: {catalog_url}");

        return BoxCatalog::load(&catalog_url)
            .with_context(|| format!("loading box catalog '{}'", catalog_file_name.display()));
    }

    info!(
        "creating new box catalog: {}",
        catalog_file_name.display()
    );
    Ok(BoxCatalog::new(&vm_name))
}

fn add_files_to_catalog(
    config: &mut Config,
    catalog: &mut BoxCatalog,
    vm_version: &str,
    target_files: &[(String, PathBuf)],
    inventory: &BoxInventory,
) -> Result<()> {
    let url_prefix = config
        .get_str("vagrant_publish_url_prefix")?
        .unwrap_or_default();

    for (provider_name, provider_file_name) in target_files {
        if config.contains("vagrant_publish_copy_command") {
            copy_published_file(config, provider_file_name, Some(provider_name))?;
        }

        let box_url = if url_prefix.is_empty() {
            format!(
                "file://{}",
                std::fs::canonicalize(provider_file_name)
                    .unwrap_or_else(|_| provider_file_name.clone())
                    .display()
            )
        } else {
            let base_name = provider_file_name
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{url_prefix}{base_name}")
        };

        let box_checksum = sha256_sum(provider_file_name).with_context(|| {
            format!("computing checksum of '{}'", provider_file_name.display())
        })?;

        catalog
            .add_version(
                vm_version,
                provider_name,
                &box_url,
                Some(&box_checksum),
                Some(CHECKSUM_TYPE),
            )
            .with_context(|| format!("adding version {vm_version} for {provider_name}"))?;

        if config.is_truthy("vagrant_uninstall_outdated_box")? {
            let vm_name = config.get_str("vm_name")?.unwrap_or_default();
            info!(
                "uninstalling outdated vagrant box: name={vm_name} provider={provider_name} version={vm_version}"
            );
            inventory.uninstall(&vm_name, provider_name, Some(vm_version))?;
        }
    }

    Ok(())
}

/// Run the publish copy command with the published file's details exposed
/// as temporary configuration keys.
fn copy_published_file(
    config: &mut Config,
    file_name: &Path,
    provider_name: Option<&str>,
) -> Result<()> {
    let saved: Vec<(&str, Option<Value>)> = ["FILE_PATH", "FILE_NAME", "FILE_PROVIDER"]
        .into_iter()
        .map(|key| (key, config.raw(key).cloned()))
        .collect();

    config.set("FILE_PATH", file_name.display().to_string());
    config.set(
        "FILE_NAME",
        file_name
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    config.set_opt(
        "FILE_PROVIDER",
        provider_name.map(|name| Value::from(name)),
    );

    let copy_command = config
        .get_str("vagrant_publish_copy_command")?
        .unwrap_or_default();

    let result = if copy_command.is_empty() {
        Ok(())
    } else {
        info!("executing vagrant publish copy command: {copy_command}");
        run_shell(&copy_command, false).map(|_| ())
    };

    for (key, value) in saved {
        config.set_opt(key, value);
    }

    result.context("running vagrant publish copy command")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn publish_config(dir: &Path) -> Config {
        Config::from_string(&format!(
            "---
vm_name: test-box
vm_version: 1.2.3
vagrant_output: {}/test-box_{{{{ .Provider }}}}.box
",
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn output_file_names_follow_the_provider_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let config = publish_config(dir.path());

        let (catalog_file_name, target_files) =
            get_output_file_names(&config, &["virtualbox", "aws"], false).unwrap();

        assert_eq!(catalog_file_name, dir.path().join("test-box.json"));
        assert_eq!(
            target_files,
            vec![
                (
                    "virtualbox".to_string(),
                    dir.path().join("test-box_virtualbox.box")
                ),
                ("aws".to_string(), dir.path().join("test-box_aws.box")),
            ]
        );
    }

    #[test]
    fn output_pattern_without_provider_marker_fails() {
        let config =
            Config::from_string("---\nvm_name: test-box\nvagrant_output: out/box.box\n").unwrap();
        assert!(get_output_file_names(&config, &["virtualbox"], false).is_err());
    }

    #[test]
    fn missing_box_file_fails_when_checked() {
        let dir = tempfile::tempdir().unwrap();
        let config = publish_config(dir.path());
        assert!(get_output_file_names(&config, &["virtualbox"], true).is_err());
    }

    #[test]
    fn publish_writes_a_catalog_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = publish_config(dir.path());

        fs::write(dir.path().join("test-box_virtualbox.box"), b"box data").unwrap();

        let inventory = BoxInventory::new("vagrant");
        publish_box(&mut config, &["virtualbox"], &inventory).unwrap();

        let catalog =
            BoxCatalog::load(&dir.path().join("test-box.json").display().to_string()).unwrap();
        assert_eq!(catalog.name, "test-box");
        assert_eq!(catalog.versions.len(), 1);
        assert_eq!(catalog.versions[0].version, "1.2.3");

        let provider = &catalog.versions[0].providers[0];
        assert_eq!(provider.name, "virtualbox");
        assert!(provider.url.starts_with("file://"));
        assert_eq!(provider.checksum_type.as_deref(), Some(CHECKSUM_TYPE));
        assert_eq!(
            provider.checksum.as_deref(),
            Some(sha256_sum(&dir.path().join("test-box_virtualbox.box")).unwrap().as_str())
        );
    }

    #[test]
    fn publish_updates_an_existing_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = publish_config(dir.path());

        fs::write(dir.path().join("test-box_virtualbox.box"), b"box data").unwrap();

        let mut existing = BoxCatalog::new("test-box");
        existing
            .add_version("1.0.0", "virtualbox", "url0", None, None)
            .unwrap();
        existing.write(&dir.path().join("test-box.json")).unwrap();

        let inventory = BoxInventory::new("vagrant");
        publish_box(&mut config, &["virtualbox"], &inventory).unwrap();

        let catalog =
            BoxCatalog::load(&dir.path().join("test-box.json").display().to_string()).unwrap();
        let order: Vec<&str> = catalog.versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(order, vec!["1.2.3", "1.0.0"]);
    }

    #[test]
    fn publish_skipped_without_vm_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_string(&format!(
            "---\nvm_name: test-box\nvagrant_output: {}/b_{{{{ .Provider }}}}.box\n",
            dir.path().display()
        ))
        .unwrap();

        let inventory = BoxInventory::new("vagrant");
        publish_box(&mut config, &["virtualbox"], &inventory).unwrap();
        assert!(!dir.path().join("test-box.json").exists());
    }

    #[test]
    fn copy_command_sees_file_keys_and_they_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("copied.txt");
        let mut config = Config::from_string(&format!(
            "---\nvagrant_publish_copy_command: echo '(( FILE_NAME ))' > {}\n",
            marker.display()
        ))
        .unwrap();
        config.set("FILE_NAME", "previous");

        copy_published_file(&mut config, Path::new("/tmp/test-box.json"), Some("aws")).unwrap();

        assert_eq!(
            fs::read_to_string(&marker).unwrap().trim(),
            "test-box.json"
        );
        // temporaries restored afterwards
        assert_eq!(
            config.get_str("FILE_NAME").unwrap().as_deref(),
            Some("previous")
        );
        assert!(!config.contains("FILE_PROVIDER"));
    }
}
