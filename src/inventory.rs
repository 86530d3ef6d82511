//! Local vagrant box inventory collaborator.
//!
//! Wraps the `vagrant box` subcommands: the installed-box list is parsed
//! from `vagrant box list` output and cached until a mutating operation
//! invalidates it. Per-provider version lists are kept descending; the
//! "no version requested" lookup returns the first entry.

use crate::process::{run_command, ProcessError};
use crate::version::{version_index, Version, VersionError};
use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Fixed output name of `vagrant box repackage`.
pub const REPACKAGED_BOX_FILE_NAME: &str = "package.box";

pub type BoxLookup = BTreeMap<String, BTreeMap<String, Vec<Version>>>;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("failed to query installed vagrant boxes: error='{0}'")]
    Query(ProcessError),

    #[error("failed to install vagrant box: name={name} provider={provider} error='{source}'")]
    Install {
        name: String,
        provider: String,
        source: ProcessError,
    },

    #[error("failed to remove vagrant box: name={name} provider={provider} error='{source}'")]
    Remove {
        name: String,
        provider: String,
        source: ProcessError,
    },

    #[error("failed to export vagrant box: name={name} provider={provider} error='{source}'")]
    Export {
        name: String,
        provider: String,
        source: ProcessError,
    },

    #[error("vagrant box is not installed: name={name} provider={provider}")]
    NotInstalled { name: String, provider: String },

    #[error(transparent)]
    Version(#[from] VersionError),
}

pub struct BoxInventory {
    vagrant_command: String,
    cache: RefCell<Option<BoxLookup>>,
}

impl BoxInventory {
    pub fn new(vagrant_command: &str) -> BoxInventory {
        BoxInventory {
            vagrant_command: vagrant_command.to_string(),
            cache: RefCell::new(None),
        }
    }

    /// The installed boxes, keyed by name then provider.
    pub fn list(&self) -> Result<BoxLookup, InventoryError> {
        self.refresh()?;
        Ok(self.cache.borrow().clone().unwrap_or_default())
    }

    fn refresh(&self) -> Result<(), InventoryError> {
        if self.cache.borrow().is_some() {
            return Ok(());
        }

        let output = run_command(&self.vagrant_command, &["box", "list"], true, None)
            .map_err(InventoryError::Query)?;

        let line_re = Regex::new(r"^(\S+)\s+\(([^,]+),\s+([^\)]+)\)").expect("static regex");

        let mut lookup = BoxLookup::new();
        for line in output.stdout_lines() {
            let Some(captures) = line_re.captures(&line) else {
                continue;
            };

            // skip boxes with unparseable versions
            let Ok(version) = Version::parse(&captures[3]) else {
                continue;
            };

            let version_list = lookup
                .entry(captures[1].to_string())
                .or_default()
                .entry(captures[2].to_string())
                .or_default();

            let (insert_at, match_at) = version_index(version, version_list);
            if match_at.is_none() {
                match insert_at {
                    Some(index) => version_list.insert(index, version),
                    None => version_list.push(version),
                }
            }
        }

        *self.cache.borrow_mut() = Some(lookup);
        Ok(())
    }

    fn reset(&self) {
        *self.cache.borrow_mut() = None;
    }

    /// The installed version of a box, or `None`.
    ///
    /// With no version requested this is the first entry of the provider's
    /// list; with one, the exact match.
    pub fn installed(
        &self,
        name: &str,
        provider: &str,
        version: Option<&str>,
    ) -> Result<Option<Version>, InventoryError> {
        self.refresh()?;

        let cache = self.cache.borrow();
        let version_list = cache
            .as_ref()
            .and_then(|lookup| lookup.get(name))
            .and_then(|providers| providers.get(provider))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        match version {
            None => Ok(version_list.first().copied()),
            Some(version) => {
                let version_val = Version::parse(version)?;
                Ok(version_list.contains(&version_val).then_some(version_val))
            }
        }
    }

    /// Install a box unless already present.
    pub fn install(
        &self,
        name: &str,
        provider: &str,
        version: Option<&str>,
    ) -> Result<(), InventoryError> {
        if self.installed(name, provider, version)?.is_some() {
            return Ok(());
        }

        let mut args = vec!["box", "add", "--provider", provider, name];
        if let Some(version) = version {
            args.extend(["--box-version", version]);
        }

        let result = run_command(&self.vagrant_command, &args, false, None);
        self.reset();

        result.map(|_| ()).map_err(|source| InventoryError::Install {
            name: name.to_string(),
            provider: provider.to_string(),
            source,
        })
    }

    /// Remove an installed box; missing boxes are a no-op.
    pub fn uninstall(
        &self,
        name: &str,
        provider: &str,
        version: Option<&str>,
    ) -> Result<(), InventoryError> {
        if self.installed(name, provider, version)?.is_none() {
            return Ok(());
        }

        let mut args = vec!["box", "remove", "--force", "--provider", provider, name];
        if let Some(version) = version {
            args.extend(["--box-version", version]);
        }

        let result = run_command(&self.vagrant_command, &args, false, None);
        self.reset();

        result.map(|_| ()).map_err(|source| InventoryError::Remove {
            name: name.to_string(),
            provider: provider.to_string(),
            source,
        })
    }

    /// Repackage an installed box into `temp_dir` and return the archive
    /// path.
    pub fn export(
        &self,
        temp_dir: &Path,
        name: &str,
        provider: &str,
        version: Version,
    ) -> Result<PathBuf, InventoryError> {
        let version_str = version.to_string();
        if self.installed(name, provider, Some(&version_str))?.is_none() {
            return Err(InventoryError::NotInstalled {
                name: name.to_string(),
                provider: provider.to_string(),
            });
        }

        info!("exporting installed vagrant box: {name} {version}");
        run_command(
            &self.vagrant_command,
            &["box", "repackage", name, provider, &version_str],
            false,
            Some(temp_dir),
        )
        .map_err(|source| InventoryError::Export {
            name: name.to_string(),
            provider: provider.to_string(),
            source,
        })?;

        Ok(temp_dir.join(REPACKAGED_BOX_FILE_NAME))
    }
}
