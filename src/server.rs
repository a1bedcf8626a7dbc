//! HTTP trigger mode
//!
//! `POST /` with a JSON object runs a set of sources, the same way the CLI
//! does:
//!
//! ```text
//! { "sources": ["walgreensSmart"], "states": "NJ,NY" }
//! ```
//!
//! `send` defaults to `true` and console output is always compact. The answer
//! is `200 Success: true` when every source succeeded, `500 Success: false`
//! otherwise. On shutdown, running loads are cancelled and the server waits
//! up to `SHUTDOWN_GRACE` for them before returning.

use crate::config::ConfigError;
use crate::pipeline::{ExitStatus, Orchestrator, RunOptions};
use crate::smart::StateList;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const DEFAULT_PORT: u16 = 3010;

/// How long shutdown waits for in-flight loads after cancelling them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const INVALID_BODY: &str = "Invalid request body! Please POST a JSON object.";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body was not an object")]
    NotAnObject,
}

/// Body of a load request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadRequest {
    #[serde(default)]
    pub sources: Vec<String>,
    /// One comma-separated string or a list of codes
    #[serde(default)]
    pub states: Option<StateList>,
    #[serde(default = "default_send")]
    pub send: bool,
}

fn default_send() -> bool {
    true
}

impl Default for LoadRequest {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            states: None,
            send: true,
        }
    }
}

impl LoadRequest {
    /// Parse a request body. An empty body means "run everything".
    pub fn from_body(body: &[u8]) -> Result<Self, RequestError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let value: serde_json::Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(RequestError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Requested state codes, upper-cased, or `None` for all states.
    pub fn states(&self) -> Option<Vec<String>> {
        let raw: Vec<&str> = match self.states.as_ref()? {
            StateList::One(list) => list.split(',').collect(),
            StateList::Many(list) => list.iter().map(String::as_str).collect(),
        };
        let states: Vec<String> = raw
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        if states.is_empty() {
            None
        } else {
            Some(states)
        }
    }
}

/// Builds a fresh orchestrator for each request.
pub type OrchestratorFactory =
    Arc<dyn Fn(&LoadRequest) -> Result<Orchestrator, ConfigError> + Send + Sync>;

#[derive(Clone)]
struct ServerState {
    factory: OrchestratorFactory,
    run_timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
}

fn router(state: ServerState) -> Router {
    Router::new().route("/", post(load)).with_state(state)
}

async fn load(State(state): State<ServerState>, body: Bytes) -> (StatusCode, String) {
    let request = match LoadRequest::from_body(&body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("⚠️  Rejected load request: {}", e);
            return (StatusCode::BAD_REQUEST, INVALID_BODY.to_string());
        }
    };
    log::info!("📥 Received load request: {:?}", request);

    let orchestrator = match (state.factory)(&request) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("❌ Could not start load: {}", e);
            return respond(false);
        }
    };

    let cancel = orchestrator.cancel_handle();
    let mut shutdown = state.shutdown.clone();
    let watcher = tokio::spawn(async move {
        if shutdown.wait_for(|stopping| *stopping).await.is_ok() {
            cancel.cancel();
        }
    });

    let summary = orchestrator
        .run(RunOptions {
            sources: request.sources.clone(),
            states: request.states(),
            timeout: state.run_timeout,
        })
        .await;
    watcher.abort();

    respond(summary.status == ExitStatus::Success)
}

fn respond(success: bool) -> (StatusCode, String) {
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, format!("Success: {}", success))
}

/// Serve load requests on `listener` until `signal` resolves.
///
/// When it does, new connections stop, running loads are cancelled and the
/// server gets `SHUTDOWN_GRACE` to finish answering them.
pub async fn serve<F>(
    listener: TcpListener,
    factory: OrchestratorFactory,
    run_timeout: Option<Duration>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = ServerState {
        factory,
        run_timeout,
        shutdown: shutdown_rx.clone(),
    };

    log::info!("🌐 Server running at http://{}/", listener.local_addr()?);

    let server = axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            log::warn!("🛑 Shutting down server...");
            shutdown_tx.send_replace(true);
        })
        .into_future();

    let mut grace_rx = shutdown_rx;
    let grace = async move {
        if grace_rx.wait_for(|stopping| *stopping).await.is_ok() {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } else {
            futures::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => {
            log::info!("Server stopped gracefully");
            result
        }
        _ = grace => {
            log::warn!("...waited {}s, exiting.", SHUTDOWN_GRACE.as_secs());
            Ok(())
        }
    }
}
