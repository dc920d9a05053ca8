//! Supported RHCOS extensions as shipped in the OS image

use std::collections::BTreeMap;
use std::io::Read;

use serde::Deserialize;
use thiserror::Error;

/// Kind of extension the daemon installs; other kinds are ignored
pub const OS_EXTENSION_KIND: &str = "os-extension";

/// Failure reading the extensions manifest
#[derive(Debug, Error)]
pub enum ExtensionsError {
    /// The reader failed
    #[error("failed to read extensions file: {0}")]
    Read(#[from] std::io::Error),

    /// The content is not the expected JSON
    #[error("failed to unmarshal extensions file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct SupportedExtensions {
    #[serde(default)]
    extensions: BTreeMap<String, Extension>,
}

#[derive(Debug, Deserialize)]
struct Extension {
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    kind: String,
}

/// Map each supported OS extension to the packages it installs
pub fn parse_supported_extensions(mut reader: impl Read) -> Result<BTreeMap<String, Vec<String>>, ExtensionsError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    let supported: SupportedExtensions = serde_json::from_slice(&raw)?;

    Ok(supported
        .extensions
        .into_iter()
        .filter(|(_, ext)| ext.kind == OS_EXTENSION_KIND)
        .map(|(name, ext)| (name, ext.packages))
        .collect())
}
