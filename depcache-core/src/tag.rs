//! Tag hashing.
//!
//! A tag is a `(query, digest)` pair. The digest summarizes every
//! `(path, version)` pair in a manifest that matches the query, fed into a
//! streaming SHA-256 in manifest order. A query matching nothing hashes to
//! the digest of the empty set, so a later appearance of a previously absent
//! resource changes the digest.
//!
//! This lets callers record dependencies like `/app/components/foo.js` or
//! `/app/templates/**/*.hbs` and revalidate them against a newer manifest.

use std::fmt;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::QueryError;
use crate::manifest::{Manifest, ManifestEntry};

/// Characters that turn a query into a glob.
const GLOB_META: &[char] = &['*', '?', '[', '{'];

/// Query string that matches exactly `path`.
///
/// Paths without glob metacharacters are returned unchanged. Otherwise every
/// special character is backslash-escaped, so that `/routes/[id].js` is
/// revalidated as a literal rather than a character class.
pub fn exact_query(path: &str) -> String {
    if !path.contains(GLOB_META) {
        return path.to_string();
    }
    let mut query = String::with_capacity(path.len() + 4);
    for c in path.chars() {
        if matches!(c, '\\' | '*' | '?' | '[' | ']' | '{' | '}') {
            query.push('\\');
        }
        query.push(c);
    }
    query
}

/// Hex-rendered SHA-256 digest over matching manifest entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Digest of the empty match set.
    pub fn absent() -> Self {
        TagHasher::new().finish()
    }

    /// Digest of a single resource, identical to what an exact query yields
    /// against a manifest listing `path` at `version`.
    pub fn of_resource(path: &str, version: &str) -> Self {
        let mut hasher = TagHasher::new();
        hasher.update(path, version);
        hasher.finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Streaming hasher over `(path, version)` pairs.
///
/// Each field is NUL-terminated so that `("ab", "c")` and `("a", "bc")`
/// hash differently.
pub struct TagHasher {
    inner: Sha256,
}

impl TagHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, path: &str, version: &str) {
        self.inner.update(path.as_bytes());
        self.inner.update([0u8]);
        self.inner.update(version.as_bytes());
        self.inner.update([0u8]);
    }

    pub fn finish(self) -> Digest {
        Digest(hex::encode(self.inner.finalize()))
    }
}

impl Default for TagHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed manifest query.
#[derive(Debug, Clone)]
pub enum TagQuery {
    /// A single path, matched literally.
    Exact(String),
    /// A glob pattern. `*` and `?` stay within one path segment, `**` spans
    /// directories.
    Glob { pattern: String, matcher: GlobMatcher },
}

impl TagQuery {
    /// Parse a query string. Anything without glob metacharacters is an
    /// exact path.
    pub fn parse(query: &str) -> Result<Self, QueryError> {
        if !query.contains(GLOB_META) {
            return Ok(Self::Exact(query.to_string()));
        }
        let glob = GlobBuilder::new(query)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|e| QueryError::InvalidPattern {
                pattern: query.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::Glob {
            pattern: query.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// The query as written.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(path) => path,
            Self::Glob { pattern, .. } => pattern,
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, Self::Glob { .. })
    }

    /// Manifest entries matching this query, in manifest order. Excluded
    /// paths never match.
    pub fn matching<'m>(&'m self, manifest: &'m Manifest) -> Vec<&'m ManifestEntry> {
        match self {
            Self::Exact(path) => {
                if manifest.is_excluded(path) {
                    return Vec::new();
                }
                manifest.entry(path).into_iter().collect()
            }
            Self::Glob { matcher, .. } => manifest
                .entries()
                .filter(|e| matcher.is_match(&e.path) && !manifest.is_excluded(&e.path))
                .collect(),
        }
    }

    /// Digest of this query against `manifest`.
    pub fn digest(&self, manifest: &Manifest) -> Digest {
        match self {
            Self::Exact(path) => match manifest.version_of(path) {
                Some(version) if !manifest.is_excluded(path) => Digest::of_resource(path, version),
                _ => Digest::absent(),
            },
            Self::Glob { .. } => {
                let mut hasher = TagHasher::new();
                for entry in self.matching(manifest) {
                    hasher.update(&entry.path, &entry.version);
                }
                hasher.finish()
            }
        }
    }
}

/// Compute the digest for `query` against `manifest`.
pub fn compute_tag(manifest: &Manifest, query: &TagQuery) -> Digest {
    query.digest(manifest)
}

/// A recorded dependency: the query a computation performed and the digest
/// it observed. Serialized as a `[query, digest]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, Digest)", into = "(String, Digest)")]
pub struct Tag {
    pub query: String,
    pub digest: Digest,
}

impl Tag {
    pub fn new(query: impl Into<String>, digest: Digest) -> Self {
        Self {
            query: query.into(),
            digest,
        }
    }

    /// Whether this tag still holds against `manifest`.
    ///
    /// A query that no longer parses can never be revalidated and counts as
    /// stale.
    pub fn is_current(&self, manifest: &Manifest) -> bool {
        match TagQuery::parse(&self.query) {
            Ok(query) => query.digest(manifest) == self.digest,
            Err(_) => false,
        }
    }
}

impl From<(String, Digest)> for Tag {
    fn from((query, digest): (String, Digest)) -> Self {
        Self { query, digest }
    }
}

impl From<Tag> for (String, Digest) {
    fn from(tag: Tag) -> Self {
        (tag.query, tag.digest)
    }
}

/// Whether every tag still holds against `manifest`. Order is irrelevant.
pub fn tags_are_current(manifest: &Manifest, tags: &[Tag]) -> bool {
    tags.iter().all(|tag| tag.is_current(manifest))
}

/// Encode a tag list as a JSON array of `[query, digest]` pairs.
pub fn encode_tags(tags: &[Tag]) -> Result<String, serde_json::Error> {
    serde_json::to_string(tags)
}

/// Decode a tag list produced by [`encode_tags`].
pub fn decode_tags(header: &str) -> Result<Vec<Tag>, serde_json::Error> {
    serde_json::from_str(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manifest(files: &[(&str, &str)]) -> Manifest {
        Manifest::from_entries(files.iter().copied(), ["/deps/"])
    }

    #[test]
    fn test_exact_query_escapes_metacharacters() {
        assert_eq!(exact_query("/app/a.js"), "/app/a.js");
        assert_eq!(exact_query("/routes/[id].js"), r"/routes/\[id\].js");
        assert_eq!(exact_query("/a/{b,c}*?"), r"/a/\{b,c\}\*\?");

        let m = manifest(&[("/routes/[id].js", "7"), ("/routes/i.js", "1")]);
        let query =
            TagQuery::parse(&exact_query("/routes/[id].js")).expect("escaped query parses");
        assert_eq!(query.digest(&m), Digest::of_resource("/routes/[id].js", "7"));

        let missing = TagQuery::parse(&exact_query("/routes/[slug].js")).expect("parses");
        assert_eq!(missing.digest(&m), Digest::absent());
    }

    #[test]
    fn test_exact_query_detection() {
        assert!(!TagQuery::parse("/app/foo.js").expect("parse").is_glob());
        assert!(TagQuery::parse("/app/*.js").expect("parse").is_glob());
        assert!(TagQuery::parse("/app/{a,b}.js").expect("parse").is_glob());
        assert!(TagQuery::parse("/app/[ab].js").expect("parse").is_glob());
    }

    #[test]
    fn test_invalid_glob_is_error() {
        let err = TagQuery::parse("/app/[").unwrap_err();
        assert!(matches!(err, QueryError::InvalidPattern { .. }));
    }

    #[test]
    fn test_exact_digest_matches_resource_digest() {
        let m = manifest(&[("/a.js", "1")]);
        let query = TagQuery::parse("/a.js").expect("parse");
        assert_eq!(query.digest(&m), Digest::of_resource("/a.js", "1"));
    }

    #[test]
    fn test_exact_digest_agrees_with_single_match_glob() {
        let m = manifest(&[("/a.js", "1"), ("/b.css", "1")]);
        let exact = TagQuery::parse("/a.js").expect("parse");
        let glob = TagQuery::parse("/*.js").expect("parse");
        assert_eq!(exact.digest(&m), glob.digest(&m));
    }

    #[test]
    fn test_missing_and_excluded_paths_are_absent() {
        let m = manifest(&[("/deps/x.js", "1")]);
        assert_eq!(
            TagQuery::parse("/nope.js").expect("parse").digest(&m),
            Digest::absent()
        );
        assert_eq!(
            TagQuery::parse("/deps/x.js").expect("parse").digest(&m),
            Digest::absent()
        );
        assert_eq!(
            TagQuery::parse("/deps/*").expect("parse").digest(&m),
            Digest::absent()
        );
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let m = manifest(&[("/x/1", "v1"), ("/x/deep/2", "v1")]);
        let shallow = TagQuery::parse("/x/*").expect("parse");
        let paths: Vec<&str> = shallow.matching(&m).iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/x/1"]);

        let deep = TagQuery::parse("/x/**").expect("parse");
        assert_eq!(deep.matching(&m).len(), 2);
    }

    #[test]
    fn test_glob_digest_changes_when_match_set_grows() {
        let before = manifest(&[("/x/1", "v1")]);
        let after = manifest(&[("/x/1", "v1"), ("/x/2", "v1")]);
        let query = TagQuery::parse("/x/*").expect("parse");
        assert_ne!(query.digest(&before), query.digest(&after));
    }

    #[test]
    fn test_empty_glob_is_absent_digest() {
        let m = manifest(&[("/x/1", "v1")]);
        let query = TagQuery::parse("/y/*").expect("parse");
        assert_eq!(query.digest(&m), Digest::absent());
    }

    #[test]
    fn test_field_boundaries_are_hashed() {
        assert_ne!(Digest::of_resource("ab", "c"), Digest::of_resource("a", "bc"));
    }

    #[test]
    fn test_tag_list_wire_format() {
        let tags = vec![
            Tag::new("/a.js", Digest::of_resource("/a.js", "1")),
            Tag::new("/x/*", Digest::absent()),
        ];
        let header = encode_tags(&tags).expect("encode");
        assert!(header.starts_with("[[\"/a.js\",\""));
        let decoded = decode_tags(&header).expect("decode");
        assert_eq!(decoded, tags);
    }

    #[test]
    fn test_unparseable_stored_query_is_stale() {
        let m = manifest(&[]);
        let tag = Tag::new("/app/[", Digest::absent());
        assert!(!tag.is_current(&m));
    }

    #[test]
    fn test_tags_are_current_ignores_order() {
        let m = manifest(&[("/a", "1"), ("/b", "2")]);
        let a = Tag::new("/a", TagQuery::parse("/a").expect("parse").digest(&m));
        let b = Tag::new("/b", TagQuery::parse("/b").expect("parse").digest(&m));
        assert!(tags_are_current(&m, &[a.clone(), b.clone()]));
        assert!(tags_are_current(&m, &[b, a]));
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-c]{1,2}", 1..4).prop_map(|segments| format!("/{}", segments.join("/")))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: computing a tag twice against the same manifest yields
        /// identical digests.
        #[test]
        fn prop_digest_is_deterministic(
            files in prop::collection::vec((path_strategy(), "[0-9]{1,3}"), 0..12),
            query in prop_oneof![path_strategy(), Just("/a/**".to_string()), Just("/*".to_string())],
        ) {
            let m = Manifest::from_entries(files, Vec::<String>::new());
            let parsed = TagQuery::parse(&query).expect("strategy produces valid queries");
            prop_assert_eq!(parsed.digest(&m), parsed.digest(&m));
            prop_assert!(Tag::new(query.clone(), parsed.digest(&m)).is_current(&m));
        }

        /// Property: changing the version of a matched path changes the digest.
        #[test]
        fn prop_version_change_invalidates_exact_tag(
            path in path_strategy(),
            v1 in "[0-9]{1,3}",
            v2 in "[0-9]{1,3}",
        ) {
            prop_assume!(v1 != v2);
            let before = Manifest::from_entries([(path.clone(), v1)], Vec::<String>::new());
            let after = Manifest::from_entries([(path.clone(), v2)], Vec::<String>::new());
            let query = TagQuery::parse(&path).expect("exact path");
            let tag = Tag::new(path, query.digest(&before));
            prop_assert!(!tag.is_current(&after));
        }
    }
}
