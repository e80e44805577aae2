//! Program side of the inter-process protocol.
//!
//! A worker reads exactly one [`LoadMessage`] from stdin, installs the
//! virtual file layer over the received artifacts, loads the entry's module
//! graph and hands everything to an application [`Runtime`]. Readiness is
//! reported back on stdout through [`WorkerContext`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::loader::{ModuleLoader, Program};
use crate::protocol::{ListeningAddress, LoadMessage, WorkerEvent};
use crate::vfs::VirtualFs;

/// Executes a loaded program inside the worker process.
pub trait Runtime {
    fn run(
        self,
        program: Program,
        fs: VirtualFs,
        ctx: WorkerContext,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

type EventSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle for reporting readiness to the supervisor.
#[derive(Clone)]
pub struct WorkerContext {
    out: Arc<Mutex<EventSink>>,
}

impl WorkerContext {
    pub fn new<W>(out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    /// Context writing to the process's stdout.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Generic "server is accepting connections" signal.
    pub async fn listening(&self, address: ListeningAddress) -> anyhow::Result<()> {
        self.send(WorkerEvent::Listening { address }).await
    }

    /// Application-level readiness signal.
    pub async fn ready(&self, address: ListeningAddress) -> anyhow::Result<()> {
        self.send(WorkerEvent::Ready { address }).await
    }

    /// Bind a TCP listener and report it as listening.
    pub async fn bind(&self, addr: SocketAddr) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.listening(listener.local_addr()?.into()).await?;
        Ok(listener)
    }

    async fn send(&self, event: WorkerEvent) -> anyhow::Result<()> {
        let line = event.to_line()?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Worker entry point over the process's stdio.
pub async fn run<R: Runtime>(runtime: R) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    run_with(stdin, WorkerContext::stdout(), runtime).await
}

pub async fn run_with<I, R>(mut input: I, ctx: WorkerContext, runtime: R) -> anyhow::Result<()>
where
    I: AsyncBufRead + Unpin,
    R: Runtime,
{
    let mut line = String::new();
    let n = input
        .read_line(&mut line)
        .await
        .context("failed to read load message")?;
    if n == 0 {
        anyhow::bail!("stdin closed before the load message arrived");
    }
    let message = LoadMessage::from_line(&line)?;
    tracing::info!(
        "Received {} artifacts, entry {}",
        message.artifacts.len(),
        message.entry.display()
    );

    let fs = VirtualFs::new(message.artifacts);
    let program = ModuleLoader::new(&fs).load(&message.entry)?;
    tracing::debug!("Loaded {} modules", program.modules.len());

    runtime.run(program, fs, ctx).await
}
