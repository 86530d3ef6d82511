//! Versioned box catalog documents.
//!
//! A catalog is a JSON document naming a box and listing its versions in
//! strictly descending order, each with per-provider download and checksum
//! metadata. Catalogs load from a local path or a `file`/`http(s)` URL and
//! are mutated only through [`BoxCatalog::add_version`].

use crate::version::{version_index, Version, VersionError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to load file: file='{file}' error='{source}'")]
    LoadFile {
        file: String,
        source: std::io::Error,
    },

    #[error("failed to download URL: url='{url}' error='{reason}'")]
    Download { url: String, reason: String },

    #[error("unsupported URL scheme: {0}")]
    Scheme(String),

    #[error("failed to decode box catalog: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("box catalog has no name")]
    MissingName,

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("failed to write box catalog: file='{file}' error='{source}'")]
    Write {
        file: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub status: VersionStatus,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl VersionEntry {
    pub fn parsed_version(&self) -> Result<Version, VersionError> {
        Version::parse(&self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxCatalog {
    pub name: String,
    pub versions: Vec<VersionEntry>,
}

fn timestamp_now() -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].000Z");
    OffsetDateTime::now_utc().format(&format).unwrap_or_default()
}

impl BoxCatalog {
    /// A fresh catalog with no versions.
    pub fn new(name: &str) -> BoxCatalog {
        BoxCatalog {
            name: name.to_string(),
            versions: Vec::new(),
        }
    }

    /// Load and validate a catalog from a local path or a `file`/`http(s)`
    /// URL.
    pub fn load(source: &str) -> Result<BoxCatalog, CatalogError> {
        let data = if let Some(path) = source.strip_prefix("file://") {
            read_local(path)?
        } else if source.starts_with("http://") || source.starts_with("https://") {
            fetch_url(source)?
        } else if source.contains("://") {
            return Err(CatalogError::Scheme(source.to_string()));
        } else {
            read_local(source)?
        };

        BoxCatalog::from_json(&data)
    }

    /// Decode and validate a catalog document.
    pub fn from_json(data: &str) -> Result<BoxCatalog, CatalogError> {
        let catalog: BoxCatalog = serde_json::from_str(data)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.name.is_empty() {
            return Err(CatalogError::MissingName);
        }

        for entry in &self.versions {
            entry.parsed_version()?;
        }

        Ok(())
    }

    fn parsed_versions(&self) -> Result<Vec<Version>, VersionError> {
        self.versions
            .iter()
            .map(VersionEntry::parsed_version)
            .collect()
    }

    /// Record a provider build for a version.
    ///
    /// New versions are inserted keeping the list strictly descending;
    /// existing ones get their `updated_at` refreshed. Re-adding a provider
    /// name overwrites that provider's url and checksum in place.
    pub fn add_version(
        &mut self,
        version: &str,
        provider: &str,
        url: &str,
        checksum: Option<&str>,
        checksum_type: Option<&str>,
    ) -> Result<(), CatalogError> {
        let version_val = Version::parse(version)?;
        let (insert_at, match_at) = version_index(version_val, &self.parsed_versions()?);

        let time_str = timestamp_now();
        let entry_index = match match_at {
            Some(index) => {
                self.versions[index].updated_at = Some(time_str);
                index
            }
            None => {
                let entry = VersionEntry {
                    version: version_val.to_string(),
                    created_at: Some(time_str.clone()),
                    updated_at: Some(time_str),
                    status: VersionStatus::Active,
                    providers: Vec::new(),
                };

                match insert_at {
                    Some(index) => {
                        self.versions.insert(index, entry);
                        index
                    }
                    None => {
                        self.versions.push(entry);
                        self.versions.len() - 1
                    }
                }
            }
        };

        let providers = &mut self.versions[entry_index].providers;
        let provider_entry = match providers.iter_mut().find(|p| p.name == provider) {
            Some(entry) => entry,
            None => {
                providers.push(ProviderEntry {
                    name: provider.to_string(),
                    url: String::new(),
                    checksum: None,
                    checksum_type: None,
                });
                providers
                    .last_mut()
                    .expect("provider entry was just pushed")
            }
        };

        provider_entry.url = url.to_string();
        if let (Some(checksum), Some(checksum_type)) = (checksum, checksum_type) {
            provider_entry.checksum = Some(checksum.to_string());
            provider_entry.checksum_type = Some(checksum_type.to_string());
        }

        Ok(())
    }

    /// Serialize to pretty JSON.
    pub fn write(&self, file_name: &Path) -> Result<(), CatalogError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(file_name, data).map_err(|source| CatalogError::Write {
            file: file_name.display().to_string(),
            source,
        })
    }
}

fn read_local(path: &str) -> Result<String, CatalogError> {
    fs::read_to_string(path).map_err(|source| CatalogError::LoadFile {
        file: path.to_string(),
        source,
    })
}

fn fetch_url(url: &str) -> Result<String, CatalogError> {
    let response = ureq::get(url).call().map_err(|err| CatalogError::Download {
        url: url.to_string(),
        reason: err.to_string(),
    })?;

    response
        .into_string()
        .map_err(|err| CatalogError::Download {
            url: url.to_string(),
            reason: err.to_string(),
        })
}
