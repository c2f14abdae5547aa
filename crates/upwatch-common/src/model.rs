//! ---
//! upw_section: "02-data-model"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Installed service, available version, and updatable map types."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Full value of the remote `updatable_services` field: service name to newer version.
pub type UpdatableServicesMap = BTreeMap<String, String>;

/// A service installed on the device together with its installed version string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledService {
    pub name: String,
    pub version: String,
}

impl InstalledService {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Latest version published for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableVersion {
    pub name: String,
    pub version: String,
}

impl AvailableVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Credentials and addressing for the device record, handed out by the local channel.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub project_id: String,
    pub api_key: String,
    pub refresh_token: String,
}

impl DeviceIdentity {
    /// Names of the fields that are empty; the identity is usable only when none are.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.device_id.trim().is_empty() {
            missing.push("device_id");
        }
        if self.project_id.trim().is_empty() {
            missing.push("project_id");
        }
        if self.api_key.trim().is_empty() {
            missing.push("api_key");
        }
        if self.refresh_token.trim().is_empty() {
            missing.push("refresh_token");
        }
        missing
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("project_id", &self.project_id)
            .field("api_key", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Change applied to a single key of the updatable map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "version", rename_all = "snake_case")]
pub enum DiffOp {
    Upsert(String),
    Remove,
}

/// Minimal set of key upserts/deletes moving one updatable map to another.
///
/// Applying a diff is idempotent: every op is "set key to value" or "delete key".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiff {
    changes: BTreeMap<String, DiffOp>,
}

impl ServiceDiff {
    /// Compute the diff that turns `current` into `desired`.
    pub fn between(current: &UpdatableServicesMap, desired: &UpdatableServicesMap) -> Self {
        let mut changes = BTreeMap::new();
        for (name, version) in desired {
            if current.get(name) != Some(version) {
                changes.insert(name.clone(), DiffOp::Upsert(version.clone()));
            }
        }
        for name in current.keys() {
            if !desired.contains_key(name) {
                changes.insert(name.clone(), DiffOp::Remove);
            }
        }
        Self { changes }
    }

    pub fn upsert(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.changes
            .insert(name.into(), DiffOp::Upsert(version.into()));
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.changes.insert(name.into(), DiffOp::Remove);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DiffOp)> {
        self.changes.iter().map(|(name, op)| (name.as_str(), op))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&DiffOp> {
        self.changes.get(name)
    }

    pub fn upserts(&self) -> impl Iterator<Item = (&str, &str)> {
        self.changes.iter().filter_map(|(name, op)| match op {
            DiffOp::Upsert(version) => Some((name.as_str(), version.as_str())),
            DiffOp::Remove => None,
        })
    }

    pub fn removals(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|(name, op)| match op {
            DiffOp::Remove => Some(name.as_str()),
            DiffOp::Upsert(_) => None,
        })
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts().count()
    }

    pub fn removal_count(&self) -> usize {
        self.removals().count()
    }

    /// Apply the diff in place.
    pub fn apply_to(&self, map: &mut UpdatableServicesMap) {
        for (name, op) in &self.changes {
            match op {
                DiffOp::Upsert(version) => {
                    map.insert(name.clone(), version.clone());
                }
                DiffOp::Remove => {
                    map.remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> UpdatableServicesMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn diff_touches_only_changed_keys() {
        let current = map(&[("a", "1.0.0"), ("b", "2.0.0"), ("c", "3.0.0")]);
        let desired = map(&[("a", "1.0.0"), ("b", "2.1.0"), ("d", "0.2.0")]);

        let diff = ServiceDiff::between(&current, &desired);

        assert_eq!(diff.len(), 3);
        assert_eq!(diff.get("a"), None);
        assert_eq!(diff.get("b"), Some(&DiffOp::Upsert("2.1.0".into())));
        assert_eq!(diff.get("c"), Some(&DiffOp::Remove));
        assert_eq!(diff.get("d"), Some(&DiffOp::Upsert("0.2.0".into())));
        assert_eq!(diff.upsert_count(), 2);
        assert_eq!(diff.removal_count(), 1);
    }

    #[test]
    fn equal_maps_produce_empty_diff() {
        let current = map(&[("a", "1.0.0")]);
        assert!(ServiceDiff::between(&current, &current.clone()).is_empty());
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let current = map(&[("a", "1.0.0"), ("c", "3.0.0")]);
        let desired = map(&[("a", "1.1.0")]);
        let diff = ServiceDiff::between(&current, &desired);

        let mut once = current.clone();
        diff.apply_to(&mut once);
        let mut twice = once.clone();
        diff.apply_to(&mut twice);

        assert_eq!(once, desired);
        assert_eq!(twice, desired);
    }

    #[test]
    fn identity_reports_missing_fields_and_redacts_secrets() {
        let identity = DeviceIdentity {
            device_id: "dev-1".into(),
            project_id: " ".into(),
            api_key: "key-123".into(),
            refresh_token: String::new(),
        };
        assert_eq!(identity.missing_fields(), vec!["project_id", "refresh_token"]);
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("dev-1"));
        assert!(!rendered.contains("key-123"));
    }

    #[test]
    fn builder_ops_override_previous_op_for_same_key() {
        let diff = ServiceDiff::default().upsert("a", "1.0.0").remove("a");
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.removals().collect::<Vec<_>>(), vec!["a"]);
    }
}
