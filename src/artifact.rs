//! In-memory build output.
//!
//! An [`ArtifactMap`] maps the virtual absolute path of every emitted asset to
//! its source text. A fresh map is produced for every successful build and is
//! never mutated afterwards, so clones are shared freely between the
//! supervisor and the worker startup message.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// One output asset of a build.
pub trait Asset {
    /// Virtual absolute path the asset would have been written to.
    fn path(&self) -> &Path;

    /// Produce the asset's source text.
    fn source(&self) -> anyhow::Result<String>;
}

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("asset '{}' could not produce its source: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("asset path '{}' is not absolute", .0.display())]
    RelativePath(PathBuf),
}

impl<A: Asset + ?Sized> Asset for &A {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn source(&self) -> anyhow::Result<String> {
        (**self).source()
    }
}

/// Immutable mapping from virtual absolute path to source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactMap {
    entries: Arc<BTreeMap<PathBuf, String>>,
}

impl ArtifactMap {
    /// Build a map from a build's assets.
    pub fn from_assets<I, A>(assets: I) -> Result<Self, ArtifactError>
    where
        I: IntoIterator<Item = A>,
        A: Asset,
    {
        let mut entries = BTreeMap::new();
        for asset in assets {
            let path = asset.path();
            if !path.is_absolute() {
                return Err(ArtifactError::RelativePath(path.to_path_buf()));
            }
            let text = asset.source().map_err(|source| ArtifactError::Source {
                path: path.to_path_buf(),
                source,
            })?;
            entries.insert(normalize(path), text);
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.entries.get(&normalize(path)).map(String::as_str)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.entries
            .iter()
            .map(|(path, text)| (path.as_path(), text.as_str()))
    }

    /// SHA-256 over every (path, text) pair, in path order.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, text) in self.entries.iter() {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(text.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

impl FromIterator<(PathBuf, String)> for ArtifactMap {
    fn from_iter<T: IntoIterator<Item = (PathBuf, String)>>(iter: T) -> Self {
        let entries = iter
            .into_iter()
            .map(|(path, text)| (normalize(&path), text))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }
}

impl Serialize for ArtifactMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for ArtifactMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<PathBuf, String>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

/// Lexically normalize a path: drop `.` and fold `..` without touching disk.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestAsset {
        path: PathBuf,
        text: Option<&'static str>,
    }

    impl Asset for TestAsset {
        fn path(&self) -> &Path {
            &self.path
        }

        fn source(&self) -> anyhow::Result<String> {
            self.text
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("source unavailable"))
        }
    }

    fn asset(path: &str, text: &'static str) -> TestAsset {
        TestAsset {
            path: PathBuf::from(path),
            text: Some(text),
        }
    }

    #[test]
    fn test_from_assets() {
        let map = ArtifactMap::from_assets(vec![
            asset("/app/index.js", "require('./util')"),
            asset("/app/util.js", "module.exports = 1"),
        ])
        .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(Path::new("/app/index.js")), Some("require('./util')"));
        assert!(map.contains(Path::new("/app/util.js")));
        assert!(!map.contains(Path::new("/app/other.js")));
    }

    #[test]
    fn test_lookup_is_normalized() {
        let map = ArtifactMap::from_assets(vec![asset("/app/./lib/../index.js", "T")]).unwrap();
        assert_eq!(map.get(Path::new("/app/index.js")), Some("T"));
        assert_eq!(map.get(Path::new("/app/lib/../index.js")), Some("T"));
    }

    #[test]
    fn test_source_failure_propagates() {
        let broken = TestAsset {
            path: PathBuf::from("/app/broken.js"),
            text: None,
        };
        let err = ArtifactMap::from_assets(vec![asset("/app/ok.js", "ok"), broken]).unwrap_err();
        match err {
            ArtifactError::Source { path, .. } => assert_eq!(path, PathBuf::from("/app/broken.js")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_relative_path_rejected() {
        let err = ArtifactMap::from_assets(vec![asset("app/index.js", "x")]).unwrap_err();
        assert!(matches!(err, ArtifactError::RelativePath(_)));
    }

    #[test]
    fn test_json_shape() {
        let map: ArtifactMap = vec![(PathBuf::from("/a.js"), "A".to_string())]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json, serde_json::json!({ "/a.js": "A" }));

        let back: ArtifactMap = serde_json::from_value(json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_content_hash_tracks_changes() {
        let a: ArtifactMap = vec![(PathBuf::from("/a.js"), "1".to_string())].into_iter().collect();
        let b: ArtifactMap = vec![(PathBuf::from("/a.js"), "2".to_string())].into_iter().collect();
        let a2 = a.clone();

        assert_eq!(a.content_hash(), a2.content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
