//! Build tool integration.
//!
//! A build tool drives [`SpawnServerPlugin`] through three hooks:
//! `watch_run` before each watch-mode compilation, `done` after every
//! build and `watch_close` when watching stops. Reloads only happen for
//! successful builds in watch mode.

pub mod dir;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifact::{ArtifactError, ArtifactMap, Asset};
use crate::supervisor::{ReloadOutcome, Supervisor, SupervisorError};

pub use dir::{DirBuild, FileAsset};

/// Read accessors over a finished build.
pub trait BuildStats {
    type Asset: Asset;

    fn is_watching(&self) -> bool;
    fn has_errors(&self) -> bool;
    /// Output directory; artifact paths live under it.
    fn output_path(&self) -> &Path;
    fn entry_filename(&self) -> &Path;
    fn assets(&self) -> &[Self::Asset];

    fn entry(&self) -> PathBuf {
        self.output_path().join(self.entry_filename())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotWatching,
    BuildErrors,
    /// The supervisor is shutting down; the build is dropped.
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Reloaded(ReloadOutcome),
    Skipped(SkipReason),
}

pub struct SpawnServerPlugin {
    supervisor: Supervisor,
    watching: AtomicBool,
}

impl SpawnServerPlugin {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            watching: AtomicBool::new(false),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Watch-mode compilation is starting.
    pub fn watch_run(&self) {
        self.watching.store(true, Ordering::Relaxed);
    }

    /// A build finished. Reloads the worker unless the build failed or the
    /// compiler is not watching.
    pub async fn done<S: BuildStats>(&self, stats: &S) -> Result<BuildOutcome, PluginError> {
        if !self.watching.load(Ordering::Relaxed) && !stats.is_watching() {
            tracing::debug!("Not in watch mode, skipping reload");
            return Ok(BuildOutcome::Skipped(SkipReason::NotWatching));
        }
        if stats.has_errors() {
            tracing::warn!("Build finished with errors, keeping the current worker");
            return Ok(BuildOutcome::Skipped(SkipReason::BuildErrors));
        }
        if self.supervisor.is_shutting_down()? {
            tracing::debug!("Shutting down, dropping finished build");
            return Ok(BuildOutcome::Skipped(SkipReason::ShuttingDown));
        }

        let artifacts = ArtifactMap::from_assets(stats.assets())?;
        let entry = stats.entry();
        let hash = artifacts.content_hash();
        tracing::info!(
            "Build finished: {} artifacts ({}), entry {}",
            artifacts.len(),
            &hash[..12],
            entry.display()
        );
        let output_dir = stats.output_path().to_path_buf();
        let outcome = self
            .supervisor
            .reload_in(artifacts, entry, Some(output_dir))
            .await?;
        Ok(BuildOutcome::Reloaded(outcome))
    }

    /// Watching stopped; close the worker.
    pub async fn watch_close(&self) -> Result<(), PluginError> {
        self.watching.store(false, Ordering::Relaxed);
        self.supervisor.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::supervisor::State;

    struct Stats {
        watching: bool,
        errors: bool,
        out: PathBuf,
        assets: Vec<FileAsset>,
    }

    impl BuildStats for Stats {
        type Asset = FileAsset;

        fn is_watching(&self) -> bool {
            self.watching
        }
        fn has_errors(&self) -> bool {
            self.errors
        }
        fn output_path(&self) -> &Path {
            &self.out
        }
        fn entry_filename(&self) -> &Path {
            Path::new("main.js")
        }
        fn assets(&self) -> &[FileAsset] {
            &self.assets
        }
    }

    fn stats(watching: bool, errors: bool) -> Stats {
        Stats {
            watching,
            errors,
            out: PathBuf::from("/build"),
            assets: vec![FileAsset::new("/build/main.js", "console.log(1)")],
        }
    }

    fn plugin() -> SpawnServerPlugin {
        SpawnServerPlugin::new(Supervisor::new(WorkerConfig::command(
            "/definitely/not/a/program",
            Vec::<String>::new(),
        )))
    }

    #[tokio::test]
    async fn test_skips_outside_watch_mode() {
        let plugin = plugin();
        let outcome = plugin.done(&stats(false, false)).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped(SkipReason::NotWatching));
        assert_eq!(plugin.supervisor().state().unwrap(), State::Idle);
    }

    #[tokio::test]
    async fn test_build_errors_skip_reload() {
        let plugin = plugin();
        plugin.watch_run();
        let outcome = plugin.done(&stats(false, true)).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped(SkipReason::BuildErrors));
        assert_eq!(plugin.supervisor().worker_pid().unwrap(), None);
    }

    #[tokio::test]
    async fn test_successful_build_reaches_supervisor() {
        // 실행 파일이 없으므로 spawn 실패가 그대로 전달되어야 함
        let plugin = plugin();
        let err = plugin.done(&stats(true, false)).await.unwrap_err();
        assert!(matches!(err, PluginError::Supervisor(SupervisorError::Spawn { .. })));
    }

    #[test]
    fn test_entry_joins_output_path() {
        assert_eq!(stats(true, false).entry(), PathBuf::from("/build/main.js"));
    }

    #[tokio::test]
    async fn test_no_reload_after_shutdown() {
        let plugin = plugin();
        plugin.watch_run();
        plugin.supervisor().shutdown().await.unwrap();

        let outcome = plugin.done(&stats(true, false)).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped(SkipReason::ShuttingDown));
        assert_eq!(plugin.supervisor().state().unwrap(), State::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_runs_in_output_directory() {
        use crate::supervisor::SupervisorEvent;

        let out = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::command(
            "sh",
            ["-c", r#"[ "$(pwd -P)" = "$EXPECTED" ] && exit 7; exit 9"#],
        );
        config.env.insert(
            "EXPECTED".into(),
            out.path().canonicalize().unwrap().display().to_string(),
        );
        let plugin = SpawnServerPlugin::new(Supervisor::new(config));
        let mut events = plugin.supervisor().subscribe();
        plugin.watch_run();

        let build = Stats {
            watching: true,
            errors: false,
            out: out.path().to_path_buf(),
            assets: vec![FileAsset::new(out.path().join("main.js"), "1")],
        };
        let pid = match plugin.done(&build).await.unwrap() {
            BuildOutcome::Reloaded(ReloadOutcome::Started { pid }) => pid,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let code = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                if let Ok(SupervisorEvent::WorkerExited { pid: exited, code }) = events.recv().await {
                    if exited == pid {
                        return code;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_keeps_listening_worker() {
        use crate::protocol::ListeningAddress;

        let script = r#"read -r line; echo '{"event":"listening","address":{"host":"127.0.0.1","port":4200}}'; exec sleep 30"#;
        let plugin = SpawnServerPlugin::new(Supervisor::new(WorkerConfig::command(
            "sh",
            ["-c", script],
        )));
        plugin.watch_run();

        let outcome = plugin.done(&stats(true, false)).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::Reloaded(ReloadOutcome::Started { .. })));
        let address = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            plugin.supervisor().wait_listening(),
        )
        .await
        .unwrap();
        assert_eq!(address, Some(ListeningAddress::new("127.0.0.1", 4200)));
        let pid = plugin.supervisor().worker_pid().unwrap();

        let outcome = plugin.done(&stats(true, true)).await.unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped(SkipReason::BuildErrors));
        assert_eq!(plugin.supervisor().address(), address);
        assert_eq!(plugin.supervisor().worker_pid().unwrap(), pid);

        plugin.watch_close().await.unwrap();
        assert_eq!(plugin.supervisor().state().unwrap(), State::Idle);
    }
}
