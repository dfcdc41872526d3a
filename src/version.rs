//! Build information served on `/service/version` and logged at startup.

use std::fmt;

use serde::Serialize;

/// Produces the version document for the running build.
pub trait VersionBuilder: Send + Sync {
    fn version(&self) -> BuildVersion;

    /// One-line form used in the startup log.
    fn to_line(&self) -> String {
        self.version().to_string()
    }
}

/// Version number, build date and commit of the running binary.
///
/// Values are taken at compile time from `VERSION_NUMBER`, `BUILD_DATE` and
/// `GIT_HASH`. A missing `VERSION_NUMBER` falls back to the crate version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildVersion {
    pub version_number: String,
    pub build_date: String,
    pub git_hash: String,
}

impl BuildVersion {
    pub fn from_build_env() -> Self {
        Self {
            version_number: option_env!("VERSION_NUMBER")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_owned(),
            build_date: option_env!("BUILD_DATE").unwrap_or("unknown").to_owned(),
            git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_owned(),
        }
    }
}

impl Default for BuildVersion {
    fn default() -> Self {
        Self::from_build_env()
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {} built {} from {}",
            self.version_number, self.build_date, self.git_hash
        )
    }
}

impl VersionBuilder for BuildVersion {
    fn version(&self) -> BuildVersion {
        self.clone()
    }
}
