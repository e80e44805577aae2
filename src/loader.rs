//! Module graph loading inside the worker.
//!
//! Starting from the entry path, every relative or absolute specifier a module
//! references is resolved through the [`VirtualFs`] and loaded once. Artifacts
//! and real files are handled the same way, so compiled output can pull in
//! anything that exists on disk next to it.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::artifact::normalize;
use crate::vfs::{FileSystem, RealFs, VirtualFs};

/// Suffixes tried, in order, when resolving a specifier.
const RESOLVE_SUFFIXES: &[&str] = &["", ".js", ".mjs", ".cjs", ".json", "/index.js"];

#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    #[error("entry '{}' does not exist", .0.display())]
    EntryNotFound(PathBuf),

    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub source: String,
    /// Resolved paths of the modules this one references.
    pub dependencies: Vec<PathBuf>,
    /// Path specifiers that matched no file. They only fail if the program
    /// actually evaluates them (optional requires, commented-out code).
    pub unresolved: Vec<String>,
    /// Served from the artifact map rather than disk.
    pub is_virtual: bool,
}

/// The loaded module graph, entry first.
#[derive(Debug, Clone)]
pub struct Program {
    pub entry: PathBuf,
    pub modules: Vec<LoadedModule>,
}

impl Program {
    pub fn entry_module(&self) -> Option<&LoadedModule> {
        self.module(&self.entry)
    }

    pub fn module(&self, path: &Path) -> Option<&LoadedModule> {
        let path = normalize(path);
        self.modules.iter().find(|m| m.path == path)
    }
}

pub struct ModuleLoader<'a, F = RealFs> {
    fs: &'a VirtualFs<F>,
}

impl<'a, F: FileSystem> ModuleLoader<'a, F> {
    pub fn new(fs: &'a VirtualFs<F>) -> Self {
        Self { fs }
    }

    pub fn load(&self, entry: &Path) -> Result<Program, LoaderError> {
        let entry = self
            .fs
            .resolve(entry)
            .map_err(|_| LoaderError::EntryNotFound(entry.to_path_buf()))?;

        let mut modules = Vec::new();
        let mut seen = HashSet::from([entry.clone()]);
        let mut queue = VecDeque::from([entry.clone()]);

        while let Some(path) = queue.pop_front() {
            let source = self.fs.read_sync(&path).map_err(|source| LoaderError::Io {
                path: path.clone(),
                source,
            })?;

            let mut dependencies = Vec::new();
            let mut unresolved = Vec::new();
            for specifier in scan_specifiers(&source) {
                if !is_path_specifier(&specifier) {
                    continue;
                }
                let Some(resolved) = self.resolve_from(&path, &specifier) else {
                    tracing::debug!(
                        "Cannot resolve '{}' from {}, leaving it to the runtime",
                        specifier,
                        path.display()
                    );
                    if !unresolved.contains(&specifier) {
                        unresolved.push(specifier);
                    }
                    continue;
                };
                if seen.insert(resolved.clone()) {
                    queue.push_back(resolved.clone());
                }
                if !dependencies.contains(&resolved) {
                    dependencies.push(resolved);
                }
            }

            tracing::debug!("Loaded module {} ({} deps)", path.display(), dependencies.len());
            modules.push(LoadedModule {
                is_virtual: self.fs.is_virtual(&path),
                path,
                source,
                dependencies,
                unresolved,
            });
        }

        Ok(Program { entry, modules })
    }

    fn resolve_from(&self, importer: &Path, specifier: &str) -> Option<PathBuf> {
        let base = if specifier.starts_with('/') {
            PathBuf::from(specifier)
        } else {
            importer
                .parent()
                .unwrap_or_else(|| Path::new("/"))
                .join(specifier)
        };
        let base = normalize(&base);

        for suffix in RESOLVE_SUFFIXES {
            let candidate = PathBuf::from(format!("{}{}", base.display(), suffix));
            if !self.fs.exists(&candidate) {
                continue;
            }
            // 디렉터리는 모듈이 아님
            if !self.fs.is_virtual(&candidate) && candidate.is_dir() {
                continue;
            }
            if let Ok(resolved) = self.fs.resolve(&candidate) {
                return Some(resolved);
            }
        }
        None
    }
}

fn is_path_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/')
}

fn specifier_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"\brequire\(\s*["']([^"']+)["']\s*\)"#,
            r#"(?m)^\s*(?:import|export)\b[^"'();]*?\bfrom\s*["']([^"']+)["']"#,
            r#"(?m)^\s*import\s*["']([^"']+)["']"#,
            r#"\bimport\(\s*["']([^"']+)["']\s*\)"#,
        ]
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("Invalid specifier pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

/// Every module specifier referenced by `source`, in source order.
fn scan_specifiers(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = specifier_patterns()
        .iter()
        .flat_map(|re| re.captures_iter(source))
        .filter_map(|caps| caps.get(1).map(|m| (m.start(), m.as_str().to_string())))
        .collect();
    found.sort_by_key(|(pos, _)| *pos);
    found.dedup_by(|a, b| a.0 == b.0);
    found.into_iter().map(|(_, spec)| spec).collect()
}
