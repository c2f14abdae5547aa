//! ---
//! upw_section: "14-versioning"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Version metadata and semantic-version comparison helpers."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Semantic-version precedence for service versions plus build metadata for
//! the daemon itself.

pub mod build_info;
pub mod update;

pub use build_info::{BuildInfo, BuildProfile};
pub use update::{is_newer, latest_published, parse_version, LatestPublished, VersionParseError};
