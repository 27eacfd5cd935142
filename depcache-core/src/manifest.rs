//! Manifest snapshot types.
//!
//! A manifest is an immutable table mapping logical resource paths to version
//! identifiers, plus exclusion rules for resources the manifest does not
//! cover. It is replaced wholesale on reload and never mutated in place.
//!
//! Entry order is significant: the tag hasher walks entries in manifest order,
//! so the order in which `files` appears in the wire document is preserved.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ManifestError;

/// One `path -> version` row of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub version: String,
}

/// A rule naming resources that the manifest does not cover.
///
/// Rules ending in `/` exclude every path under that prefix, all other rules
/// exclude exactly one path. Absence from the manifest does not imply that an
/// excluded resource does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Exclusion {
    Exact(String),
    Prefix(String),
}

impl Exclusion {
    /// Parse a wire-format exclusion rule.
    pub fn parse(rule: &str) -> Self {
        if rule.ends_with('/') {
            Self::Prefix(rule.to_string())
        } else {
            Self::Exact(rule.to_string())
        }
    }

    /// Whether `path` falls under this rule.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == path,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    /// The rule as it appears on the wire.
    pub fn as_rule(&self) -> &str {
        match self {
            Self::Exact(rule) | Self::Prefix(rule) => rule,
        }
    }
}

/// An immutable manifest snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    index: HashMap<String, usize>,
    excluded: Vec<Exclusion>,
}

impl Manifest {
    /// Build a manifest from entries in manifest order and wire-format
    /// exclusion rules.
    ///
    /// A path listed twice keeps its first position and its last version.
    pub fn from_entries<I, P, V, E, R>(files: I, excluded: E) -> Self
    where
        I: IntoIterator<Item = (P, V)>,
        P: Into<String>,
        V: Into<String>,
        E: IntoIterator<Item = R>,
        R: AsRef<str>,
    {
        let mut manifest = Self {
            excluded: excluded
                .into_iter()
                .map(|rule| Exclusion::parse(rule.as_ref()))
                .collect(),
            ..Self::default()
        };
        for (path, version) in files {
            manifest.push(path.into(), version.into());
        }
        manifest
    }

    fn push(&mut self, path: String, version: String) {
        match self.index.get(&path) {
            Some(&position) => self.entries[position].version = version,
            None => {
                self.index.insert(path.clone(), self.entries.len());
                self.entries.push(ManifestEntry { path, version });
            }
        }
    }

    /// Decode a manifest document: `{ "files": {..}, "excluded": [..] }`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Decode {
            reason: e.to_string(),
        })
    }

    /// Encode this manifest as a wire document.
    pub fn to_json(&self) -> Result<String, ManifestError> {
        serde_json::to_string(self).map_err(|e| ManifestError::Decode {
            reason: e.to_string(),
        })
    }

    /// Version recorded for `path`, if the manifest lists it.
    pub fn version_of(&self, path: &str) -> Option<&str> {
        self.index
            .get(path)
            .map(|&position| self.entries[position].version.as_str())
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.index.get(path).map(|&position| &self.entries[position])
    }

    /// Whether `path` lies under one of the exclusion rules.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|rule| rule.matches(path))
    }

    /// Entries in manifest order.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn excluded(&self) -> &[Exclusion] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Serialize, Deserialize)]
struct ManifestDocument {
    files: OrderedFiles,
    #[serde(default)]
    excluded: Vec<String>,
}

/// The `files` object, kept in document order.
struct OrderedFiles(Vec<(String, String)>);

impl Serialize for OrderedFiles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (path, version) in &self.0 {
            map.serialize_entry(path, version)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedFiles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilesVisitor;

        impl<'de> Visitor<'de> for FilesVisitor {
            type Value = OrderedFiles;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of path to version")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut files = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((path, version)) = access.next_entry::<String, String>()? {
                    files.push((path, version));
                }
                Ok(OrderedFiles(files))
            }
        }

        deserializer.deserialize_map(FilesVisitor)
    }
}

impl Serialize for Manifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ManifestDocument {
            files: OrderedFiles(
                self.entries
                    .iter()
                    .map(|e| (e.path.clone(), e.version.clone()))
                    .collect(),
            ),
            excluded: self
                .excluded
                .iter()
                .map(|rule| rule.as_rule().to_string())
                .collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let document = ManifestDocument::deserialize(deserializer)?;
        Ok(Manifest::from_entries(document.files.0, document.excluded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_preserves_document_order() {
        let json = br#"{"files": {"/z.js": "3", "/a.js": "1", "/m.js": "2"}, "excluded": []}"#;
        let manifest = Manifest::from_json(json).expect("manifest should decode");
        let paths: Vec<&str> = manifest.entries().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/z.js", "/a.js", "/m.js"]);
        assert_eq!(manifest.version_of("/a.js"), Some("1"));
    }

    #[test]
    fn test_excluded_defaults_to_empty() {
        let manifest = Manifest::from_json(br#"{"files": {"/a": "1"}}"#).expect("decode");
        assert!(manifest.excluded().is_empty());
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_malformed_document_is_decode_error() {
        let err = Manifest::from_json(b"{\"files\": [1, 2]}").unwrap_err();
        assert!(matches!(err, ManifestError::Decode { .. }));
    }

    #[test]
    fn test_exclusion_rules() {
        let manifest = Manifest::from_entries(
            [("/app.js", "1")],
            ["/deps/", "/worker.js"],
        );
        assert!(manifest.is_excluded("/deps/lodash.js"));
        assert!(manifest.is_excluded("/worker.js"));
        assert!(!manifest.is_excluded("/worker.json"));
        assert!(!manifest.is_excluded("/app.js"));
        assert_eq!(
            manifest.excluded(),
            &[
                Exclusion::Prefix("/deps/".to_string()),
                Exclusion::Exact("/worker.js".to_string())
            ]
        );
    }

    #[test]
    fn test_duplicate_path_keeps_position_and_last_version() {
        let manifest = Manifest::from_entries(
            [("/a", "1"), ("/b", "1"), ("/a", "2")],
            Vec::<String>::new(),
        );
        let rows: Vec<(&str, &str)> = manifest
            .entries()
            .map(|e| (e.path.as_str(), e.version.as_str()))
            .collect();
        assert_eq!(rows, vec![("/a", "2"), ("/b", "1")]);
    }

    #[test]
    fn test_json_round_trip_keeps_order_and_rules() {
        let manifest = Manifest::from_entries(
            [("/b", "2"), ("/a", "1")],
            ["/deps/"],
        );
        let json = manifest.to_json().expect("encode");
        let back = Manifest::from_json(json.as_bytes()).expect("decode");
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_missing_path_has_no_version() {
        let manifest = Manifest::default();
        assert!(manifest.is_empty());
        assert_eq!(manifest.version_of("/nope"), None);
    }
}
