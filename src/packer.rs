//! The generated packer build document.
//!
//! Three top-level arrays, populated by the targets, the provisioner
//! parser and the export post-processor, then written to a scratch path
//! for the external tool (and optionally to the working directory for
//! inspection).

use serde_json::{json, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};

pub const PACKER_DOC_FILE_NAME: &str = "packer.json";

#[derive(Debug, Default, PartialEq)]
pub struct PackerDocument {
    builders: Vec<JsonValue>,
    provisioners: Vec<JsonValue>,
    post_processors: Vec<JsonValue>,
}

impl PackerDocument {
    pub fn new() -> PackerDocument {
        PackerDocument::default()
    }

    pub fn add_builder(&mut self, builder: JsonValue) {
        self.builders.push(builder);
    }

    pub fn add_provisioner(&mut self, provisioner: JsonValue) {
        self.provisioners.push(provisioner);
    }

    pub fn add_post_processor(&mut self, post_processor: JsonValue) {
        self.post_processors.push(post_processor);
    }

    pub fn builder_count(&self) -> usize {
        self.builders.len()
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "builders": self.builders,
            "provisioners": self.provisioners,
            "post-processors": self.post_processors,
        })
    }

    /// Write the document as pretty JSON, returning the file path.
    pub fn write(&self, file_path: Option<&Path>) -> Result<PathBuf, std::io::Error> {
        let file_name = match file_path {
            Some(path) => path.join(PACKER_DOC_FILE_NAME),
            None => PathBuf::from(PACKER_DOC_FILE_NAME),
        };

        let data = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(&file_name, data)?;

        Ok(file_name)
    }
}
