//! Worker supervisor.
//!
//! Owns the single current [`WorkerHandle`], drives the lifecycle state
//! machine and publishes the listening address. All state lives behind one
//! mutex that is never held across an `.await`; background tasks (exit
//! monitor, readiness listener, next-tick completion) take it to apply
//! transitions.
//!
//! Reload and close share one protocol: register a completion with the
//! [`RestartCoordinator`], then begin closing the current worker. Only when
//! its exit has been observed does the latest registered completion run, so
//! a new worker never starts while the old one is alive.

pub mod error;
pub mod events;
pub mod restart;
pub mod state_machine;
pub mod worker_handle;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::artifact::ArtifactMap;
use crate::config::WorkerConfig;
use crate::protocol::{ListeningAddress, LoadMessage, WorkerEvent};
use crate::routing::Routing;

pub use error::SupervisorError;
pub use events::SupervisorEvent;
pub use restart::{RestartCoordinator, RestartToken};
pub use state_machine::State;
pub use worker_handle::{WorkerExit, WorkerHandle};

use events::EventBus;
use state_machine::StateMachine;

/// Result of a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// This request was the latest one; its worker was spawned.
    Started { pid: u32 },
    /// A later reload or close replaced this request before it ran.
    Superseded,
}

type RestartCallback = Box<dyn FnOnce(&Arc<Inner>, &mut Slot) + Send>;

struct Slot {
    machine: StateMachine,
    current: Option<WorkerHandle>,
    restart: RestartCoordinator<RestartCallback>,
    /// A close completion is on its way.
    close_pending: bool,
    /// Bumped on every close cycle; stale next-tick completions compare it.
    close_epoch: u64,
    /// Set once by `shutdown`; later reloads are refused.
    shutting_down: bool,
}

struct Inner {
    config: WorkerConfig,
    slot: Mutex<Slot>,
    events: EventBus,
    next_worker_id: AtomicU64,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                slot: Mutex::new(Slot {
                    machine: StateMachine::new(),
                    current: None,
                    restart: RestartCoordinator::new(),
                    close_pending: false,
                    close_epoch: 0,
                    shutting_down: false,
                }),
                events: EventBus::new(),
                next_worker_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> Result<State, SupervisorError> {
        Ok(self.inner.lock()?.machine.state)
    }

    /// PID of the current worker, if one is alive.
    pub fn worker_pid(&self) -> Result<Option<u32>, SupervisorError> {
        Ok(self.inner.lock()?.current.as_ref().map(WorkerHandle::pid))
    }

    /// Snapshot of the listening address. `Some` only while listening.
    pub fn address(&self) -> Option<ListeningAddress> {
        self.inner.events.address()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Routing surface for a proxying front end.
    pub fn routing(&self) -> Routing {
        Routing::new(self.inner.events.address_rx())
    }

    /// Wait until a worker is listening.
    pub async fn wait_listening(&self) -> Option<ListeningAddress> {
        self.routing().ready().await.ok()
    }

    /// Close the current worker and start a new one with `artifacts`.
    ///
    /// Concurrent reloads collapse: only the latest request spawns a worker,
    /// earlier ones resolve to [`ReloadOutcome::Superseded`]. The worker runs
    /// in the entry's directory unless the config names a `cwd`.
    pub async fn reload(
        &self,
        artifacts: ArtifactMap,
        entry: impl Into<PathBuf>,
    ) -> Result<ReloadOutcome, SupervisorError> {
        let entry = entry.into();
        let output_dir = entry.parent().map(Path::to_path_buf);
        self.reload_in(artifacts, entry, output_dir).await
    }

    /// [`reload`](Self::reload) with an explicit build output directory as
    /// the worker's default working directory.
    pub async fn reload_in(
        &self,
        artifacts: ArtifactMap,
        entry: impl Into<PathBuf>,
        output_dir: Option<PathBuf>,
    ) -> Result<ReloadOutcome, SupervisorError> {
        let entry = entry.into();
        let (tx, rx) = oneshot::channel();
        let token = {
            let mut slot = self.inner.lock()?;
            if slot.shutting_down {
                tracing::info!("Shutting down, ignoring reload of {}", entry.display());
                return Ok(ReloadOutcome::Superseded);
            }
            let callback: RestartCallback = Box::new(move |inner, slot| {
                let started = inner.start_locked(slot, entry, artifacts, output_dir.as_deref());
                let _ = tx.send(started);
            });
            let token = slot.restart.request(callback);
            self.inner.begin_close(&mut slot);
            token
        };
        tracing::info!("Reload {} requested", token);

        match rx.await {
            Ok(Ok(pid)) => Ok(ReloadOutcome::Started { pid }),
            Ok(Err(e)) => {
                tracing::error!("Reload {} failed: {}", token, e);
                Err(e)
            }
            Err(_) => {
                tracing::debug!("Reload {} superseded", token);
                Ok(ReloadOutcome::Superseded)
            }
        }
    }

    /// Close the current worker. Idempotent; completes on a later tick even
    /// when nothing is running. A pending reload is superseded by the close.
    ///
    /// Returns only after the worker that was current at the call has exited,
    /// even if a later reload replaced this close's completion.
    pub async fn close(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        let exited = {
            let mut slot = self.inner.lock()?;
            let exited = slot.current.as_ref().map(WorkerHandle::exited);
            let callback: RestartCallback = Box::new(move |_, _| {
                let _ = tx.send(());
            });
            slot.restart.request(callback);
            self.inner.begin_close(&mut slot);
            exited
        };
        if rx.await.is_err() {
            // 이후 reload가 완료 콜백을 대체함; 이전 워커의 종료만 기다림
            if let Some(exited) = exited {
                let exit = exited.await;
                tracing::debug!("Close superseded; previous worker exited with {:?}", exit.code);
            }
        }
        Ok(())
    }

    /// Close the worker for good. Reloads requested afterwards resolve to
    /// [`ReloadOutcome::Superseded`] without spawning.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.inner.lock()?.shutting_down = true;
        self.close().await
    }

    pub fn is_shutting_down(&self) -> Result<bool, SupervisorError> {
        Ok(self.inner.lock()?.shutting_down)
    }

    /// Shut down once `signal` resolves (host interrupt, terminate or exit).
    /// Call once, right after construction; await the returned handle before
    /// the host exits.
    pub fn attach_shutdown<F>(&self, signal: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            signal.await;
            tracing::info!("Shutdown signal received, closing worker");
            if let Err(e) = supervisor.shutdown().await {
                tracing::error!("Failed to close worker on shutdown: {}", e);
            }
        })
    }
}

impl Inner {
    /// Mutex 락 획득 헬퍼
    fn lock(&self) -> Result<MutexGuard<'_, Slot>, SupervisorError> {
        self.slot.lock().map_err(|e| {
            tracing::error!("Supervisor lock poisoned: {}", e);
            SupervisorError::LockPoisoned
        })
    }

    /// Close algorithm. Completion runs the latest restart callback.
    fn begin_close(self: &Arc<Self>, slot: &mut Slot) {
        if slot.close_pending {
            // the completion already on its way will pick up the latest callback
            return;
        }
        slot.close_pending = true;
        slot.close_epoch += 1;

        let Some(handle) = slot.current.as_ref() else {
            self.complete_next_tick(slot.close_epoch);
            return;
        };

        if let Err(e) = slot.machine.transition(State::Closing) {
            tracing::error!("Cannot close worker {}: {}", handle.id(), e);
        }
        handle.revoke_readiness();
        self.events.publish_closing();

        if handle.is_running() {
            // exit monitor finishes the close
            handle.terminate();
        } else {
            self.complete_next_tick(slot.close_epoch);
        }
    }

    fn complete_next_tick(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let Ok(mut slot) = inner.lock() else {
                tracing::error!("Dropping close completion #{}: supervisor state unavailable", epoch);
                return;
            };
            if slot.close_pending && slot.close_epoch == epoch {
                inner.finish_close(&mut slot);
            }
        });
    }

    fn finish_close(self: &Arc<Self>, slot: &mut Slot) {
        slot.close_pending = false;
        if let Some(handle) = slot.current.take() {
            tracing::info!("Worker {} (pid: {}) closed", handle.id(), handle.pid());
        }
        if slot.machine.state == State::Closing {
            if let Err(e) = slot.machine.transition(State::Idle) {
                tracing::error!("{}", e);
            }
        }

        if let Some((token, callback)) = slot.restart.take() {
            callback(self, slot);
            if slot.machine.state == State::Running {
                self.events.emit(SupervisorEvent::RestartComplete(token));
            }
        }
    }

    /// Starting -> Running: spawn, send the load message, attach listeners.
    fn start_locked(
        self: &Arc<Self>,
        slot: &mut Slot,
        entry: PathBuf,
        artifacts: ArtifactMap,
        output_dir: Option<&Path>,
    ) -> Result<u32, SupervisorError> {
        slot.machine.transition(State::Starting)?;

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let mut handle = match WorkerHandle::spawn(id, &self.config, output_dir) {
            Ok(handle) => handle,
            Err(e) => {
                Self::reset_to_idle(slot);
                return Err(e);
            }
        };

        tracing::info!(
            "Loading {} ({} artifacts) into worker {}",
            entry.display(),
            artifacts.len(),
            id
        );
        if let Err(e) = handle.send_load(&LoadMessage::new(entry, artifacts)) {
            handle.terminate();
            Self::reset_to_idle(slot);
            return Err(e);
        }

        slot.machine.transition(State::Running)?;
        let pid = handle.pid();
        self.attach_readiness(&mut handle);
        self.watch_exit(&handle);
        slot.current = Some(handle);
        Ok(pid)
    }

    /// Starting -> Idle after a failed start.
    fn reset_to_idle(slot: &mut Slot) {
        if let Err(e) = slot.machine.transition(State::Idle) {
            tracing::error!("Cannot reset after failed start: {}", e);
        }
    }

    /// Running -> Listening on the configured readiness signal.
    fn attach_readiness(self: &Arc<Self>, handle: &mut WorkerHandle) {
        let Some(mut events) = handle.take_events() else {
            return;
        };
        let revoked = handle.readiness_token();
        let wait_for_ready = self.config.wait_for_ready;
        let id = handle.id();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = revoked.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                let wanted = match event {
                    WorkerEvent::Ready { .. } => wait_for_ready,
                    WorkerEvent::Listening { .. } => !wait_for_ready,
                };
                if !wanted {
                    tracing::debug!("Worker {} sent {:?}, not the configured signal", id, event);
                    continue;
                }

                let Ok(mut slot) = inner.lock() else {
                    return;
                };
                let is_current = slot.current.as_ref().map(WorkerHandle::id) == Some(id);
                if revoked.is_cancelled() || !is_current || slot.machine.state != State::Running {
                    return;
                }
                if let Err(e) = slot.machine.transition(State::Listening) {
                    tracing::error!("{}", e);
                    return;
                }
                let address = event.address().clone();
                tracing::info!("Worker {} listening on {}", id, address);
                inner.events.publish_listening(address);
                return;
            }
        });
    }

    /// Observe the worker's exit: finish a close, or handle a crash.
    fn watch_exit(self: &Arc<Self>, handle: &WorkerHandle) {
        let exited = handle.exited();
        let id = handle.id();
        let pid = handle.pid();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let exit = exited.await;
            let Ok(mut slot) = inner.lock() else {
                return;
            };
            inner.events.emit(SupervisorEvent::WorkerExited {
                pid,
                code: exit.code,
            });

            let is_current = slot.current.as_ref().map(WorkerHandle::id) == Some(id);
            if !is_current {
                return;
            }

            if slot.machine.state == State::Closing {
                if slot.close_pending {
                    inner.finish_close(&mut slot);
                }
                return;
            }

            tracing::warn!(
                "Worker {} (pid: {}) exited unexpectedly with code {:?}; waiting for the next build",
                id,
                pid,
                exit.code
            );
            if let Some(handle) = slot.current.take() {
                handle.revoke_readiness();
            }
            if slot.machine.state == State::Listening {
                inner.events.publish_closing();
            }
            if let Err(e) = slot.machine.transition(State::Idle) {
                tracing::error!("{}", e);
            }
        });
    }
}
