//! Version files: the JSON form of a full or partial model version
//!
//! ```json
//! {
//!   "version": 7,
//!   "partial": { "removed_sets": ["old-site"] },
//!   "resources": [
//!     { "id": "std::File[host1,path=/etc/motd]", "attributes": { "content": "hi" } }
//!   ]
//! }
//! ```
//!
//! Without `partial` the file is a full version.

use anyhow::{Context, Result};
use deploykit::{ModelVersion, PartialVersion, ResourceRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionFile {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialSection>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PartialSection {
    #[serde(default)]
    pub removed_sets: Vec<String>,
}

/// A parsed version ready for the scheduler
pub enum Intake {
    Full(ModelVersion),
    Partial(PartialVersion),
}

impl Intake {
    pub fn version(&self) -> u64 {
        match self {
            Self::Full(model) => model.version,
            Self::Partial(partial) => partial.version,
        }
    }

    /// Resources carried by the file
    pub fn resources(&self) -> &ModelVersion {
        match self {
            Self::Full(model) => model,
            Self::Partial(partial) => &partial.updates,
        }
    }
}

impl VersionFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid version file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Build the model, hashing attributes
    ///
    /// Full versions are validated here; partial versions are validated when
    /// merged into the managed model.
    pub fn into_intake(self) -> Result<Intake> {
        let model = ModelVersion::from_records(self.version, self.resources)?;
        match self.partial {
            None => {
                model.validate()?;
                Ok(Intake::Full(model))
            }
            Some(partial) => Ok(Intake::Partial(PartialVersion::new(
                model,
                partial.removed_sets,
            ))),
        }
    }
}
