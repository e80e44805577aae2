//! Built-in worker runtime: serves the loaded program over HTTP.
//!
//! `GET /` lists the module graph, `GET /<path>` returns the source of a
//! module relative to the entry's directory. Only artifacts and modules
//! reachable from the entry are served.

use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::loader::Program;
use crate::vfs::VirtualFs;
use crate::worker::{Runtime, WorkerContext};

const DEFAULT_HOST: &str = "127.0.0.1";

struct ServeState {
    program: Program,
    fs: VirtualFs,
    root: PathBuf,
}

/// Binds `$HOST:$PORT` (default `127.0.0.1:0`), reports `listening` once
/// bound and `ready` once the router is serving.
#[derive(Debug, Clone, Default)]
pub struct ServeRuntime {
    addr: Option<SocketAddr>,
}

impl ServeRuntime {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr: Some(addr) }
    }

    fn resolve_addr(&self) -> anyhow::Result<SocketAddr> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var("PORT").unwrap_or_else(|_| "0".to_string());
        Ok(format!("{host}:{port}").parse()?)
    }
}

impl Runtime for ServeRuntime {
    async fn run(self, program: Program, fs: VirtualFs, ctx: WorkerContext) -> anyhow::Result<()> {
        let listener = ctx.bind(self.resolve_addr()?).await?;
        let local = listener.local_addr()?;
        let app = router(program, fs);
        tracing::info!("Serving on http://{}", local);

        ctx.ready(local.into()).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn router(program: Program, fs: VirtualFs) -> Router {
    let root = program
        .entry
        .parent()
        .map(FsPath::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let state = Arc::new(ServeState { program, fs, root });

    Router::new()
        .route("/", get(index))
        .route("/*path", get(module_source))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET / - 로드된 모듈 목록
async fn index(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
    let modules: Vec<_> = state
        .program
        .modules
        .iter()
        .map(|m| {
            serde_json::json!({
                "path": m.path,
                "virtual": m.is_virtual,
                "bytes": m.source.len(),
                "dependencies": m.dependencies,
            })
        })
        .collect();
    Json(serde_json::json!({
        "entry": state.program.entry,
        "modules": modules,
    }))
}

/// GET /*path - 모듈 소스
async fn module_source(
    State(state): State<Arc<ServeState>>,
    Path(path): Path<String>,
) -> Response {
    let relative = FsPath::new(&path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let full = state.root.join(relative);
    if !state.fs.is_virtual(&full) && state.program.module(&full).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state.fs.read(&full).await {
        Ok(text) => ([(header::CONTENT_TYPE, content_type(&full))], text).into_response(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", full.display(), e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js" | "mjs" | "cjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        _ => "text/plain; charset=utf-8",
    }
}
