//! Virtual file layer used inside the worker.
//!
//! Paths present in the [`ArtifactMap`] are served from memory; every other
//! path falls through to the wrapped [`FileSystem`]. The layer never shadows a
//! path that the build did not emit.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact::{normalize, ArtifactMap};

/// File primitives the virtual layer falls through to.
pub trait FileSystem: Send + Sync {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    fn read_to_string_async(
        &self,
        path: &Path,
    ) -> impl Future<Output = io::Result<String>> + Send;
}

/// The real disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string_async(
        &self,
        path: &Path,
    ) -> impl Future<Output = io::Result<String>> + Send {
        let path = path.to_path_buf();
        async move { tokio::fs::read_to_string(path).await }
    }
}

/// Artifact-backed view over a fallback file system.
#[derive(Debug, Clone)]
pub struct VirtualFs<F = RealFs> {
    artifacts: ArtifactMap,
    fallback: F,
}

impl VirtualFs<RealFs> {
    pub fn new(artifacts: ArtifactMap) -> Self {
        Self::with_fallback(artifacts, RealFs)
    }
}

impl<F: FileSystem> VirtualFs<F> {
    pub fn with_fallback(artifacts: ArtifactMap, fallback: F) -> Self {
        tracing::debug!("Virtual file layer covers {} artifacts", artifacts.len());
        Self {
            artifacts,
            fallback,
        }
    }

    pub fn artifacts(&self) -> &ArtifactMap {
        &self.artifacts
    }

    /// Whether `path` is served from memory.
    pub fn is_virtual(&self, path: &Path) -> bool {
        self.artifacts.contains(path)
    }

    /// Resolve `path` to the file that would be loaded for it.
    pub fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        if self.artifacts.contains(path) {
            return Ok(normalize(path));
        }
        self.fallback.canonicalize(path)
    }

    pub fn read_sync(&self, path: &Path) -> io::Result<String> {
        match self.artifacts.get(path) {
            Some(text) => Ok(text.to_string()),
            None => self.fallback.read_to_string(path),
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.artifacts.contains(path) || self.fallback.exists(path)
    }

    /// Asynchronous read. In-memory hits still yield to the scheduler once, so
    /// the returned future is never ready on its first poll.
    pub async fn read(&self, path: &Path) -> io::Result<String> {
        if let Some(text) = self.artifacts.get(path) {
            let text = text.to_string();
            tokio::task::yield_now().await;
            return Ok(text);
        }
        self.fallback.read_to_string_async(path).await
    }
}

impl<F: FileSystem + Clone + 'static> VirtualFs<F> {
    /// Callback flavour of [`VirtualFs::read`]. The callback always runs on a
    /// spawned task, never inside this call.
    pub fn read_with<C>(&self, path: impl Into<PathBuf>, callback: C) -> tokio::task::JoinHandle<()>
    where
        C: FnOnce(io::Result<String>) + Send + 'static,
    {
        let fs = self.clone();
        let path = path.into();
        tokio::spawn(async move {
            let result = fs.read(&path).await;
            callback(result);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::poll_fn;
    use std::sync::{Arc, Mutex};
    use std::task::Poll;

    /// Fallback with a fixed set of "disk" files.
    #[derive(Clone, Default)]
    struct FakeDisk {
        files: Arc<HashMap<PathBuf, String>>,
    }

    impl FakeDisk {
        fn with(files: &[(&str, &str)]) -> Self {
            Self {
                files: Arc::new(
                    files
                        .iter()
                        .map(|(p, t)| (PathBuf::from(p), t.to_string()))
                        .collect(),
                ),
            }
        }

        fn lookup(&self, path: &Path) -> io::Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    impl FileSystem for FakeDisk {
        fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
            self.lookup(path).map(|_| path.to_path_buf())
        }

        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            self.lookup(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }

        fn read_to_string_async(
            &self,
            path: &Path,
        ) -> impl Future<Output = io::Result<String>> + Send {
            let result = self.lookup(path);
            async move { result }
        }
    }

    fn fs() -> VirtualFs<FakeDisk> {
        let artifacts: ArtifactMap = vec![(PathBuf::from("/app/index.js"), "T".to_string())]
            .into_iter()
            .collect();
        VirtualFs::with_fallback(artifacts, FakeDisk::with(&[("/etc/config.json", "{}")]))
    }

    #[tokio::test]
    async fn test_every_interception_point_round_trips() {
        let fs = fs();
        let entry = Path::new("/app/index.js");

        assert_eq!(fs.resolve(entry).unwrap(), PathBuf::from("/app/index.js"));
        assert!(fs.exists(entry));
        assert_eq!(fs.read_sync(entry).unwrap(), "T");
        assert_eq!(fs.read(entry).await.unwrap(), "T");

        let (tx, rx) = tokio::sync::oneshot::channel();
        fs.read_with(entry, move |res| {
            let _ = tx.send(res.unwrap());
        });
        assert_eq!(rx.await.unwrap(), "T");
    }

    #[tokio::test]
    async fn test_fallthrough_to_disk() {
        let fs = fs();
        let real = Path::new("/etc/config.json");

        assert!(!fs.is_virtual(real));
        assert!(fs.exists(real));
        assert_eq!(fs.read_sync(real).unwrap(), "{}");
        assert_eq!(fs.read(real).await.unwrap(), "{}");
        assert_eq!(fs.resolve(real).unwrap(), PathBuf::from("/etc/config.json"));

        let missing = Path::new("/nope.js");
        assert!(!fs.exists(missing));
        assert_eq!(fs.read_sync(missing).unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(fs.resolve(missing).is_err());
    }

    #[tokio::test]
    async fn test_virtual_read_never_ready_on_first_poll() {
        let fs = fs();
        let mut read = Box::pin(fs.read(Path::new("/app/index.js")));

        let first = poll_fn(|cx| Poll::Ready(read.as_mut().poll(cx).is_ready())).await;
        assert!(!first, "in-memory read resolved synchronously");
        assert_eq!(read.await.unwrap(), "T");
    }

    #[tokio::test]
    async fn test_read_with_runs_after_caller() {
        let fs = fs();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        let handle = fs.read_with("/app/index.js", move |_| seen.lock().unwrap().push("callback"));
        order.lock().unwrap().push("caller");
        handle.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["caller", "callback"]);
    }

    #[tokio::test]
    async fn test_real_fs_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("on-disk.txt");
        std::fs::write(&file, "disk").unwrap();

        let fs = VirtualFs::new(ArtifactMap::default());
        assert!(fs.exists(&file));
        assert_eq!(fs.read_sync(&file).unwrap(), "disk");
        assert_eq!(fs.read(&file).await.unwrap(), "disk");
    }
}
