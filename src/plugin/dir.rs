//! Directory-backed build stand-in used by the `run` command: treats the
//! current contents of an output directory as a finished build.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

use super::BuildStats;
use crate::artifact::Asset;

/// An asset whose text was read eagerly from disk.
#[derive(Debug, Clone)]
pub struct FileAsset {
    path: PathBuf,
    text: String,
}

impl FileAsset {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

impl Asset for FileAsset {
    fn path(&self) -> &Path {
        &self.path
    }

    fn source(&self) -> anyhow::Result<String> {
        Ok(self.text.clone())
    }
}

pub struct DirBuild {
    out_dir: PathBuf,
    entry_filename: PathBuf,
    watching: bool,
    assets: Vec<FileAsset>,
    errors: Vec<String>,
}

impl DirBuild {
    /// Snapshot every file under `out_dir`. A missing entry file counts as a
    /// build error. Non UTF-8 files are reported the same way.
    pub fn scan(
        out_dir: &Path,
        entry_filename: impl Into<PathBuf>,
        watching: bool,
    ) -> anyhow::Result<Self> {
        let out_dir = out_dir
            .canonicalize()
            .with_context(|| format!("output directory {} not found", out_dir.display()))?;
        let entry_filename = entry_filename.into();

        let pattern = format!(
            "{}/**/*",
            glob::Pattern::escape(&out_dir.to_string_lossy())
        );
        let mut assets = Vec::new();
        let mut errors = Vec::new();
        for path in glob::glob(&pattern)?.filter_map(Result::ok) {
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(text) => assets.push(FileAsset::new(path, text)),
                Err(e) => errors.push(format!("{}: {}", path.display(), e)),
            }
        }
        assets.sort_by(|a, b| a.path.cmp(&b.path));

        let entry = out_dir.join(&entry_filename);
        if !assets.iter().any(|a| a.path == entry) {
            errors.push(format!("entry {} was not emitted", entry.display()));
        }

        Ok(Self {
            out_dir,
            entry_filename,
            watching,
            assets,
            errors,
        })
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Content digest of the snapshot; changes whenever a file is added,
    /// removed or edited.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for asset in &self.assets {
            hasher.update(asset.path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(asset.text.as_bytes());
            hasher.update([0u8]);
        }
        for error in &self.errors {
            hasher.update(error.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl BuildStats for DirBuild {
    type Asset = FileAsset;

    fn is_watching(&self) -> bool {
        self.watching
    }

    fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn output_path(&self) -> &Path {
        &self.out_dir
    }

    fn entry_filename(&self) -> &Path {
        &self.entry_filename
    }

    fn assets(&self) -> &[FileAsset] {
        &self.assets
    }
}
