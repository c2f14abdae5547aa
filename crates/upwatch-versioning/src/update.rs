//! ---
//! upw_section: "14-versioning"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Semantic-version precedence for published service versions."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::cmp::Ordering;

use semver::Version;

/// A version string that is not a valid semantic version.
#[derive(Debug, thiserror::Error)]
#[error("invalid semantic version {input:?}: {source}")]
pub struct VersionParseError {
    /// The rejected input.
    pub input: String,
    /// Parser diagnostic.
    #[source]
    pub source: semver::Error,
}

/// Parse a service version, tolerating surrounding whitespace and a leading `v`.
pub fn parse_version(input: &str) -> Result<Version, VersionParseError> {
    let trimmed = input.trim();
    let candidate = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(candidate).map_err(|source| VersionParseError {
        input: input.to_owned(),
        source,
    })
}

/// SemVer precedence: numeric major/minor/patch, then pre-release. Build
/// metadata never affects ordering.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

/// Whether `available` strictly exceeds `installed`. Equal versions are not newer.
pub fn is_newer(installed: &str, available: &str) -> Result<bool, VersionParseError> {
    let installed = parse_version(installed)?;
    let available = parse_version(available)?;
    Ok(precedence(&available, &installed) == Ordering::Greater)
}

/// Outcome of picking the newest entry from a published version list.
#[derive(Debug, Default)]
pub struct LatestPublished {
    /// Highest-precedence version, in its published spelling.
    pub latest: Option<String>,
    /// Entries that could not be parsed and were ignored.
    pub rejected: Vec<VersionParseError>,
}

/// Select the highest published version; unparsable entries are skipped.
pub fn latest_published<S: AsRef<str>>(versions: &[S]) -> LatestPublished {
    let mut best: Option<(Version, &str)> = None;
    let mut rejected = Vec::new();
    for raw in versions {
        let raw = raw.as_ref();
        match parse_version(raw) {
            Ok(version) => {
                let replace = match &best {
                    Some((current, _)) => precedence(&version, current) == Ordering::Greater,
                    None => true,
                };
                if replace {
                    best = Some((version, raw));
                }
            }
            Err(err) => rejected.push(err),
        }
    }
    LatestPublished {
        latest: best.map(|(_, raw)| raw.trim().to_owned()),
        rejected,
    }
}
