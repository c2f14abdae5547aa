//! ---
//! upw_section: "14-versioning"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Build metadata reported by the daemon at startup and on --version."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::fmt;

use serde::Serialize;

/// Cargo profile the daemon was compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    /// Built with debug assertions.
    Debug,
    /// Optimised build.
    Release,
    /// `vergen` did not report the debug flag.
    Unknown,
}

impl BuildProfile {
    fn from_debug_flag(flag: Option<&str>) -> Self {
        match flag {
            Some("true") => Self::Debug,
            Some("false") => Self::Release,
            _ => Self::Unknown,
        }
    }

    /// Label used for the `profile` metric dimension.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
            Self::Unknown => "unknown",
        }
    }
}

/// What was built, when, and for which target. Captured via `vergen`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    /// Workspace semantic version.
    pub version: &'static str,
    /// RFC 3339 build timestamp, `UNKNOWN` outside cargo builds.
    pub built_at: &'static str,
    /// Target triple.
    pub target: &'static str,
    /// Compilation profile.
    pub profile: BuildProfile,
}

impl BuildInfo {
    /// Metadata of the running binary.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            built_at: option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("UNKNOWN"),
            target: option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("UNKNOWN"),
            profile: BuildProfile::from_debug_flag(option_env!("VERGEN_CARGO_DEBUG")),
        }
    }

    /// Multi-line form printed by `--version`.
    #[must_use]
    pub fn extended(&self) -> String {
        format!("{self}\nBuilt: {}\nTarget: {}", self.built_at, self.target)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upwatch v{} ({})", self.version, self.profile.as_str())
    }
}
