//! Optional caller-identity collaborator.
//!
//! The `aws_account`, `aws_user` and `aws_arn` expansion functions are only
//! registered when an [`IdentityProvider`] has been injected into the
//! configuration store. The shipped implementation shells out to the `aws`
//! CLI; the binary wires it up only when the tool is on the PATH.

use crate::process::run_command;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Account,
    User,
    Arn,
}

impl IdentityField {
    fn document_key(self) -> &'static str {
        match self {
            IdentityField::Account => "Account",
            IdentityField::User => "UserId",
            IdentityField::Arn => "Arn",
        }
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity lookup failed: {0}")]
    Lookup(String),
}

pub trait IdentityProvider {
    fn lookup(&self, field: IdentityField) -> Result<String, IdentityError>;
}

/// Identity lookups via `aws sts get-caller-identity`.
pub struct AwsCliIdentity {
    command: String,
}

impl AwsCliIdentity {
    /// Locate the `aws` CLI, if installed.
    pub fn discover() -> Option<AwsCliIdentity> {
        which::which("aws").ok().map(|path| AwsCliIdentity {
            command: path.to_string_lossy().into_owned(),
        })
    }
}

impl IdentityProvider for AwsCliIdentity {
    fn lookup(&self, field: IdentityField) -> Result<String, IdentityError> {
        let output = run_command(
            &self.command,
            &["sts", "get-caller-identity", "--output", "json"],
            true,
            None,
        )
        .map_err(|err| IdentityError::Lookup(err.to_string()))?;

        let document: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|err| IdentityError::Lookup(format!("invalid identity document: {err}")))?;

        document
            .get(field.document_key())
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                IdentityError::Lookup(format!(
                    "identity document missing field: {}",
                    field.document_key()
                ))
            })
    }
}
