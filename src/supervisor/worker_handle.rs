//! Worker Handle - one spawned worker process
//!
//! The supervisor owns exactly one of these at a time. A handle provides:
//! - the stdin channel the startup message is written to
//! - readiness events parsed from the worker's stdout
//! - stdout/stderr forwarding into the supervisor's log
//! - exit tracking through a watch channel
//! - termination (SIGTERM, then a hard kill after the grace period)

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::error::SupervisorError;
use crate::config::WorkerConfig;
use crate::protocol::{LoadMessage, WorkerEvent};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

pub struct WorkerHandle {
    id: u64,
    pid: u32,
    /// Channel to send lines to stdin
    stdin_tx: mpsc::Sender<String>,
    /// Readiness events; taken once by the readiness listener
    events: Option<mpsc::Receiver<WorkerEvent>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    terminate: CancellationToken,
    readiness: CancellationToken,
}

impl WorkerHandle {
    /// Spawn a worker process. Must be called inside a tokio runtime.
    ///
    /// The working directory is `config.cwd` when set, else `default_cwd`
    /// (the build output directory) if it exists on disk, else inherited.
    pub fn spawn(
        id: u64,
        config: &WorkerConfig,
        default_cwd: Option<&Path>,
    ) -> Result<Self, SupervisorError> {
        let (program, args) = config.program().map_err(|source| SupervisorError::Spawn {
            program: "<current executable>".to_string(),
            source,
        })?;

        let mut cmd = TokioCommand::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match (&config.cwd, default_cwd) {
            (Some(cwd), _) => {
                cmd.current_dir(cwd);
            }
            (None, Some(dir)) if dir.is_dir() => {
                cmd.current_dir(dir);
            }
            (None, Some(dir)) => {
                tracing::debug!("Output directory {} is not on disk, inheriting cwd", dir.display());
            }
            (None, None) => {}
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned worker"))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(4);
        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>(16);
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminate = CancellationToken::new();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                while let Some(line) = next_lossy_line(&mut reader, pid).await {
                    match WorkerEvent::from_line(&line) {
                        Some(event) => {
                            tracing::debug!("Worker {} signaled {:?}", pid, event);
                            // 리스너가 이미 끝났으면 무시
                            let _ = events_tx.send(event).await;
                        }
                        None => tracing::info!(target: "worker", "[{}] {}", pid, line),
                    }
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                while let Some(line) = next_lossy_line(&mut reader, pid).await {
                    forward_stderr(pid, &line);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin) = child.stdin.take() {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        tokio::spawn(wait_for_exit(
            child,
            pid,
            terminate.clone(),
            config.kill_timeout(),
            exit_tx,
        ));

        tracing::info!("Worker {} started with PID {}", id, pid);

        Ok(Self {
            id,
            pid,
            stdin_tx,
            events: Some(events_rx),
            exit_rx,
            terminate,
            readiness: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write the startup message. Never blocks: the channel is fresh.
    pub fn send_load(&self, message: &LoadMessage) -> Result<(), SupervisorError> {
        let line = message.to_line()?;
        self.stdin_tx
            .try_send(line)
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<WorkerEvent>> {
        self.events.take()
    }

    /// Token the readiness listener watches; cancelled on revocation.
    pub fn readiness_token(&self) -> CancellationToken {
        self.readiness.clone()
    }

    /// Revoke the readiness listener so a late signal is ignored.
    pub fn revoke_readiness(&self) {
        self.readiness.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Ask the process to terminate. Exit is reported through [`Self::exited`].
    pub fn terminate(&self) {
        tracing::info!("Terminating worker {} (pid: {})", self.id, self.pid);
        self.terminate.cancel();
    }

    /// Resolves once the process has exited.
    pub fn exited(&self) -> impl Future<Output = WorkerExit> + Send + 'static {
        let mut rx = self.exit_rx.clone();
        async move {
            loop {
                let exit = *rx.borrow_and_update();
                if let Some(exit) = exit {
                    return exit;
                }
                if rx.changed().await.is_err() {
                    return WorkerExit { code: None };
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.readiness.cancel();
        if self.is_running() {
            self.terminate.cancel();
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: u32,
    terminate: CancellationToken,
    kill_timeout: Duration,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = terminate.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            send_terminate(&mut child, pid);
            match tokio::time::timeout(kill_timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!("Worker {} ignored SIGTERM for {:?}, killing", pid, kill_timeout);
                    if let Err(e) = child.start_kill() {
                        tracing::error!("Failed to kill worker {}: {}", pid, e);
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => {
            tracing::info!("Worker {} exited with {}", pid, status);
            WorkerExit {
                code: status.code(),
            }
        }
        Err(e) => {
            tracing::error!("Failed to wait for worker {}: {}", pid, e);
            WorkerExit { code: None }
        }
    };
    exit_tx.send_replace(Some(exit));
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("Failed to send SIGTERM to worker {}: {}, killing", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill worker {}: {}", pid, e);
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Next output line, invalid UTF-8 replaced. `None` at EOF or on a read
/// error; the pipe must stay drained until then.
async fn next_lossy_line<R: AsyncBufRead + Unpin>(reader: &mut R, pid: u32) -> Option<String> {
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(&buf);
            Some(line.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(e) => {
            tracing::warn!("Failed to read output of worker {}: {}", pid, e);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn level_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b(?P<level>ERROR|WARN|INFO|DEBUG|TRACE)\b").ok())
        .as_ref()
}

/// Parse the log level from a worker's stderr line.
///
/// Lines without a recognizable level default to Warn, since stderr usually
/// carries diagnostics.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(line) {
            if let Some(level_match) = caps.name("level") {
                return match level_match.as_str() {
                    "ERROR" => LogLevel::Error,
                    "WARN" => LogLevel::Warn,
                    "DEBUG" | "TRACE" => LogLevel::Debug,
                    _ => LogLevel::Info,
                };
            }
        }
    }
    LogLevel::Warn
}

fn forward_stderr(pid: u32, line: &str) {
    match parse_log_level(line, level_pattern()) {
        LogLevel::Error => tracing::error!(target: "worker", "[{}] {}", pid, line),
        LogLevel::Warn => tracing::warn!(target: "worker", "[{}] {}", pid, line),
        LogLevel::Info => tracing::info!(target: "worker", "[{}] {}", pid, line),
        LogLevel::Debug => tracing::debug!(target: "worker", "[{}] {}", pid, line),
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactMap;
    use std::time::Duration;

    #[test]
    fn test_parse_log_level() {
        let re = level_pattern();
        assert_eq!(
            parse_log_level("2026-01-01T00:00:00Z  INFO spawn_server::serve: listening", re),
            LogLevel::Info
        );
        assert_eq!(parse_log_level(" ERROR boom", re), LogLevel::Error);
        assert_eq!(parse_log_level(" TRACE detail", re), LogLevel::Debug);
        // plain stderr output defaults to Warn
        assert_eq!(parse_log_level("Segmentation fault", re), LogLevel::Warn);
        assert_eq!(parse_log_level(" INFO x", None), LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let config = WorkerConfig::command("/definitely/not/a/program", Vec::<String>::new());
        match WorkerHandle::spawn(1, &config, None) {
            Err(SupervisorError::Spawn { program, .. }) => {
                assert_eq!(program, "/definitely/not/a/program")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_message_and_ready_event() {
        let script = r#"read -r line; echo '{"event":"ready","address":{"host":"127.0.0.1","port":7001}}'; exec sleep 30"#;
        let mut handle = WorkerHandle::spawn(1, &WorkerConfig::command("sh", ["-c", script]), None).unwrap();
        handle
            .send_load(&LoadMessage::new("/app/index.js", ArtifactMap::default()))
            .unwrap();

        let mut events = handle.take_events().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.address().port, 7001);
        assert!(handle.is_running());

        handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(10), handle.exited())
            .await
            .unwrap();
        assert_eq!(exit.code, None, "terminated by signal");
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_lossy_lines_survive_invalid_utf8() {
        let mut reader = BufReader::new(&b"log \xff\r\nnext\nlast"[..]);
        assert_eq!(next_lossy_line(&mut reader, 1).await.as_deref(), Some("log \u{fffd}"));
        assert_eq!(next_lossy_line(&mut reader, 1).await.as_deref(), Some("next"));
        assert_eq!(next_lossy_line(&mut reader, 1).await.as_deref(), Some("last"));
        assert_eq!(next_lossy_line(&mut reader, 1).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_event_after_invalid_utf8_output() {
        let script = r#"read -r line; printf 'log \377\n'; printf 'warn \377\n' >&2; echo '{"event":"listening","address":{"host":"127.0.0.1","port":7002}}'; exec sleep 30"#;
        let mut handle = WorkerHandle::spawn(1, &WorkerConfig::command("sh", ["-c", script]), None).unwrap();
        handle
            .send_load(&LoadMessage::new("/app/index.js", ArtifactMap::default()))
            .unwrap();

        let mut events = handle.take_events().unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.address().port, 7002);
        assert!(handle.is_running());
        handle.terminate();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hard_kill_after_grace_period() {
        let mut config = WorkerConfig::command("sh", ["-c", "trap '' TERM; while true; do sleep 1; done"]);
        config.kill_timeout_ms = 200;
        let handle = WorkerHandle::spawn(1, &config, None).unwrap();

        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(10), handle.exited())
            .await
            .unwrap();
        assert_eq!(exit.code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_reported() {
        let handle = WorkerHandle::spawn(1, &WorkerConfig::command("sh", ["-c", "exit 3"]), None).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), handle.exited())
            .await
            .unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[cfg(unix)]
    async fn exit_code_in(config: &WorkerConfig, default_cwd: Option<&Path>) -> Option<i32> {
        let handle = WorkerHandle::spawn(1, config, default_cwd).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle.exited())
            .await
            .unwrap()
            .code
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_directory_selection() {
        let out = tempfile::tempdir().unwrap();
        let configured = tempfile::tempdir().unwrap();
        let script = r#"[ "$(pwd -P)" = "$EXPECTED" ] && exit 7; exit 9"#;

        let mut config = WorkerConfig::command("sh", ["-c", script]);
        config.env.insert(
            "EXPECTED".into(),
            out.path().canonicalize().unwrap().display().to_string(),
        );
        // output directory by default
        assert_eq!(exit_code_in(&config, Some(out.path())).await, Some(7));
        // a missing output directory falls back to the inherited cwd
        assert_eq!(
            exit_code_in(&config, Some(&out.path().join("absent"))).await,
            Some(9)
        );

        // configured cwd wins
        config.cwd = Some(configured.path().to_path_buf());
        config.env.insert(
            "EXPECTED".into(),
            configured.path().canonicalize().unwrap().display().to_string(),
        );
        assert_eq!(exit_code_in(&config, Some(out.path())).await, Some(7));
    }
}
