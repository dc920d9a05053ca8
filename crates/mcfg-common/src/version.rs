//! Identity of the running controller build
//!
//! Two strings identify a build: the raw release version (compared against the
//! ControllerConfig written by the operator) and the build hash (stamped on every
//! MachineConfig the controller generates).

use std::fmt;

/// Version strings of the running controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerVersion {
    /// Release version, e.g. "4.14.0-0.nightly-2024-01-01"
    pub raw: String,
    /// Build hash, e.g. a git commit
    pub hash: String,
}

impl ControllerVersion {
    /// Create a version from its two parts
    pub fn new(raw: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            hash: hash.into(),
        }
    }

    /// Version of this binary as recorded at build time.
    ///
    /// `MCFG_VERSION_RAW` / `MCFG_VERSION_HASH` set at compile time take
    /// precedence over the crate version.
    pub fn from_build() -> Self {
        Self {
            raw: option_env!("MCFG_VERSION_RAW")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            hash: option_env!("MCFG_VERSION_HASH")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

impl fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.raw, self.hash)
    }
}
