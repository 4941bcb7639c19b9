//! HTTP front end.
//!
//! Workers speak a flat query-string protocol: every request is `GET /` (or a
//! form `POST /`) carrying an `action` and its parameters, and every reply is
//! plain text.

use crate::coordinator::Coordinator;
use axum::{
    Router,
    extract::{ConnectInfo, Form, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router for the worker protocol.
pub fn build_router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/", get(query_action).post(form_action))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn query_action(
    State(coordinator): State<Coordinator>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    run_action(coordinator, remote, params).await
}

async fn form_action(
    State(coordinator): State<Coordinator>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    run_action(coordinator, remote, params).await
}

/// Store work blocks on the connection mutex, so keep it off the runtime threads.
async fn run_action(
    coordinator: Coordinator,
    remote: SocketAddr,
    params: HashMap<String, String>,
) -> impl IntoResponse {
    let ip = remote.ip().to_string();
    let text = match tokio::task::spawn_blocking(move || coordinator.handle(&params, &ip)).await {
        Ok(text) => text,
        Err(e) => {
            error!("Request worker panicked: {}", e);
            "Error: Server failure, please retry\n".to_string()
        }
    };
    plain(text)
}

async fn health() -> impl IntoResponse {
    plain("OK\n".to_string())
}

fn plain(body: String) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}

/// Bind `addr` and serve until `shutdown` fires.
///
/// Returns the address actually bound, which differs from `addr` when the
/// port is 0.
pub async fn start_server(
    coordinator: Coordinator,
    addr: &str,
    shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = build_router(coordinator);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Coordinator listening on http://{}", bound_addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
            info!("Coordinator shutting down");
        })
        .await
        {
            error!("Server error: {}", e);
        }
    });

    Ok((bound_addr, handle))
}
