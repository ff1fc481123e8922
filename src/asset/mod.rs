//! # Asset Model
//!
//! The working representation of one asset moving through a processor chain.
//!
//! An [`AssetRef`] is what a request or a coordinator hands us: a URI, an
//! optional set of pre-resolved attributes, and whether the bytes live on this
//! node or must be materialized from a remote source. The [`AssetBuilder`] is
//! the mutable document processors write into; it carries the previously
//! stored version (when one exists) so persistence can distinguish updates
//! from creates, and collects derived child references discovered during
//! processing. An [`Asset`] is the immutable snapshot handed back to callers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Attribute keys prefixed with `@` append to a list attribute instead of
/// replacing it.
pub const APPEND_ATTR_PREFIX: char = '@';

/// A reference to one asset inside an analysis request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    /// Local path or remote URI of the asset bytes
    pub uri: String,
    /// Attributes to apply to the asset before processing. Keys starting
    /// with `@` append to a list attribute.
    #[serde(default)]
    pub attrs: Map<String, Value>,
    /// Whether the bytes must be fetched from a remote source
    #[serde(default)]
    pub remote: bool,
}

impl AssetRef {
    pub fn local(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            attrs: Map::new(),
            remote: false,
        }
    }

    pub fn remote(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            attrs: Map::new(),
            remote: true,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Lowercase extension of the referenced path, empty when there is none
    pub fn extension(&self) -> String {
        extension_of(&self.uri)
    }
}

/// Immutable snapshot of a persisted or processed asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub document: Value,
}

/// Mutable working representation of one asset under analysis
#[derive(Debug, Clone)]
pub struct AssetBuilder {
    id: String,
    path: PathBuf,
    extension: String,
    document: Map<String, Value>,
    previous: Option<Asset>,
    derived: Vec<String>,
    remote_source: Option<String>,
    closed: bool,
}

impl AssetBuilder {
    /// Create a builder for a local file. The asset id is a stable content
    /// address derived from the absolute path, so re-analyzing the same file
    /// updates the same stored document.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes()).to_string();

        let mut builder = Self {
            id,
            path: path.clone(),
            extension: extension.clone(),
            document: Map::new(),
            previous: None,
            derived: Vec::new(),
            remote_source: None,
            closed: false,
        };
        builder.set_attr("source.path", json!(path.to_string_lossy()));
        builder.set_attr(
            "source.filename",
            json!(path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()),
        );
        builder.set_attr("source.extension", json!(extension));
        builder
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Record the URI this asset was materialized from
    pub fn set_remote_source(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        self.set_attr("source.remote_source_uri", json!(uri));
        self.remote_source = Some(uri);
    }

    pub fn remote_source(&self) -> Option<&str> {
        self.remote_source.as_deref()
    }

    /// Carry forward the previously stored version of this asset, when one
    /// exists, for update-vs-create accounting downstream
    pub fn set_previous_version(&mut self, previous: Option<Asset>) {
        self.previous = previous;
    }

    pub fn previous_version(&self) -> Option<&Asset> {
        self.previous.as_ref()
    }

    /// Set an attribute by dotted path, creating intermediate objects
    pub fn set_attr(&mut self, path: &str, value: Value) {
        let mut current = &mut self.document;
        let segments: Vec<&str> = path.split('.').collect();
        for segment in &segments[..segments.len() - 1] {
            let entry = current
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("entry forced to object");
        }
        current.insert(segments[segments.len() - 1].to_string(), value);
    }

    /// Append a value to a list attribute by dotted path, creating the list
    /// when absent
    pub fn add_to_attr(&mut self, path: &str, value: Value) {
        match self.get_attr_mut(path) {
            Some(Value::Array(items)) => items.push(value),
            _ => self.set_attr(path, Value::Array(vec![value])),
        }
    }

    /// Look up an attribute by dotted path
    pub fn get_attr(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.document.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    fn get_attr_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.document.get_mut(first)?;
        for segment in segments {
            current = current.as_object_mut()?.get_mut(segment)?;
        }
        Some(current)
    }

    /// Remove an attribute by dotted path, returning whether it existed
    pub fn remove_attr(&mut self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = &mut self.document;
        for segment in &segments[..segments.len() - 1] {
            match current.get_mut(*segment).and_then(Value::as_object_mut) {
                Some(next) => current = next,
                None => return false,
            }
        }
        current.remove(segments[segments.len() - 1]).is_some()
    }

    /// Apply an attribute from a request entry, honoring the `@` append
    /// prefix
    pub fn apply_entry_attr(&mut self, key: &str, value: Value) {
        if let Some(stripped) = key.strip_prefix(APPEND_ATTR_PREFIX) {
            self.add_to_attr(stripped, value);
        } else {
            self.set_attr(key, value);
        }
    }

    /// Queue a derived child reference discovered while processing this asset
    pub fn add_derived(&mut self, uri: impl Into<String>) {
        self.derived.push(uri.into());
    }

    /// Take the derived child references, leaving this asset's list empty so
    /// the links are not persisted twice
    pub fn take_derived(&mut self) -> Vec<String> {
        std::mem::take(&mut self.derived)
    }

    pub fn has_derived(&self) -> bool {
        !self.derived.is_empty()
    }

    /// Release per-asset resources. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(asset = %self.id, "Closed asset builder");
        }
    }

    /// Immutable snapshot of the current document
    pub fn snapshot(&self) -> Asset {
        Asset {
            id: self.id.clone(),
            document: Value::Object(self.document.clone()),
        }
    }
}

/// Lowercase extension of a path or URI, empty when there is none
pub fn extension_of(uri: &str) -> String {
    Path::new(uri.trim_end_matches('/'))
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Strip a `file://` scheme if present, yielding a local filesystem path
pub fn local_path_of(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_id_is_stable_per_path() {
        let a = AssetBuilder::new("/data/images/cat.jpg");
        let b = AssetBuilder::new("/data/images/cat.jpg");
        let c = AssetBuilder::new("/data/images/dog.jpg");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_dotted_attr_round_trip() {
        let mut builder = AssetBuilder::new("/data/a.jpg");
        builder.set_attr("image.width", json!(640));
        builder.set_attr("image.height", json!(480));
        assert_eq!(builder.get_attr("image.width"), Some(&json!(640)));
        assert_eq!(builder.get_attr("image.height"), Some(&json!(480)));

        assert!(builder.remove_attr("image.width"));
        assert!(!builder.remove_attr("image.width"));
        assert_eq!(builder.get_attr("image.width"), None);
    }

    #[test]
    fn test_append_prefix_builds_a_list() {
        let mut builder = AssetBuilder::new("/data/a.jpg");
        builder.apply_entry_attr("@links.parents", json!("parent-1"));
        builder.apply_entry_attr("@links.parents", json!("parent-2"));
        assert_eq!(
            builder.get_attr("links.parents"),
            Some(&json!(["parent-1", "parent-2"]))
        );

        builder.apply_entry_attr("media.title", json!("holiday"));
        assert_eq!(builder.get_attr("media.title"), Some(&json!("holiday")));
    }

    #[test]
    fn test_take_derived_clears_the_list() {
        let mut builder = AssetBuilder::new("/data/report.pdf");
        builder.add_derived("/data/report.pdf.page1.jpg");
        builder.add_derived("/data/report.pdf.page2.jpg");

        let derived = builder.take_derived();
        assert_eq!(derived.len(), 2);
        assert!(!builder.has_derived());
    }

    #[test]
    fn test_source_attrs_are_populated() {
        let builder = AssetBuilder::new("/data/images/CAT.JPG");
        assert_eq!(builder.extension(), "jpg");
        assert_eq!(
            builder.get_attr("source.filename"),
            Some(&json!("CAT.JPG"))
        );
    }

    #[test]
    fn test_local_path_strips_file_scheme() {
        assert_eq!(
            local_path_of("file:///data/a.jpg"),
            PathBuf::from("/data/a.jpg")
        );
        assert_eq!(local_path_of("/data/a.jpg"), PathBuf::from("/data/a.jpg"));
    }
}
