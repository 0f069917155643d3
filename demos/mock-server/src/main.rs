//! Mock dashboard server streaming pipeline activity over WebSocket.
//!
//! Run with: cargo run -p pulsewire-mock-server
//!
//! Clients connect to ws://localhost:3000/ws. Set `MOCK_TOKEN` to require a
//! `?token=` query parameter, and `MOCK_RESTART_AFTER` to close every
//! connection with "service restart" after that many updates.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use pulsewire_core::{
    GitActivity, InfraMetric, Message as Envelope, Payload, PipelineSnapshot, PipelineUpdate,
    RunNode, RunStatus,
};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RUN_ID: &str = "run-1024";

#[derive(Clone)]
struct AppState {
    token: Option<String>,
    restart_after: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let state = AppState {
        token: std::env::var("MOCK_TOKEN").ok().filter(|t| !t.is_empty()),
        restart_after: std::env::var("MOCK_RESTART_AFTER")
            .ok()
            .and_then(|v| v.parse().ok()),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Mock server listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    if let Some(expected) = &state.token {
        if params.get("token") != Some(expected) {
            tracing::warn!("Rejecting connection with missing or wrong token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let feed_task = tokio::spawn(run_feed(tx.clone(), state.restart_after));

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                continue;
            }
        };

        match envelope.kind.as_str() {
            "connect" => tracing::info!(payload = %envelope.payload, "Client announced"),
            "ping" => queue(&tx, Envelope::pong()),
            other => tracing::info!(kind = other, "Client message"),
        }
    }

    feed_task.abort();
    send_task.abort();
    tracing::info!("Client disconnected");
}

fn queue(tx: &mpsc::UnboundedSender<Message>, envelope: Envelope) {
    match serde_json::to_string(&envelope.stamped()) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json.into()));
        }
        Err(e) => tracing::error!("Failed to serialize message: {e}"),
    }
}

fn queue_payload<P: Payload>(tx: &mpsc::UnboundedSender<Message>, payload: &P) {
    match payload.to_message() {
        Ok(envelope) => queue(tx, envelope),
        Err(e) => tracing::error!("Failed to serialize payload: {e}"),
    }
}

fn snapshot() -> PipelineSnapshot {
    let jobs = |names: &[&str]| names.iter().map(|n| RunNode::new(*n)).collect::<Vec<_>>();
    PipelineSnapshot {
        run_id: Some(RUN_ID.to_string()),
        stages: vec![
            RunNode::new("build").with_children(vec![
                RunNode::new("compile").with_children(jobs(&["fetch", "cargo build"])),
            ]),
            RunNode::new("test").with_children(vec![
                RunNode::new("unit").with_children(jobs(&["cargo test"])),
                RunNode::new("integration"),
            ]),
            RunNode::new("deploy").with_children(jobs(&["staging"])),
        ],
    }
}

fn script() -> Vec<PipelineUpdate> {
    let mut updates = Vec::new();
    let plan = [
        ("build", "compile"),
        ("test", "unit"),
        ("test", "integration"),
        ("deploy", "staging"),
    ];
    for (stage, job) in plan {
        updates.push(PipelineUpdate::stage(stage).status(RunStatus::Running));
        for progress in [25, 50, 75] {
            updates.push(
                PipelineUpdate::stage(stage)
                    .job(job)
                    .status(RunStatus::Running)
                    .progress(progress),
            );
        }
        updates.push(PipelineUpdate::stage(stage).job(job).status(RunStatus::Success));
        updates.push(PipelineUpdate::stage(stage).status(RunStatus::Success));
    }
    for update in &mut updates {
        update.run_id = Some(RUN_ID.to_string());
    }
    updates
}

async fn run_feed(tx: mpsc::UnboundedSender<Message>, restart_after: Option<usize>) {
    queue_payload(&tx, &snapshot());

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    for (sent, update) in script().iter().enumerate() {
        ticker.tick().await;
        if restart_after == Some(sent) {
            tracing::info!("Simulating service restart");
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: 1012,
                reason: "service restart".into(),
            })));
            return;
        }
        queue_payload(&tx, update);

        if sent % 4 == 0 {
            queue_payload(
                &tx,
                &InfraMetric {
                    host: "runner-3".to_string(),
                    metric: "cpu".to_string(),
                    value: 40.0 + f64::from(u32::try_from(sent).unwrap_or(0) % 50),
                    unit: Some("%".to_string()),
                },
            );
        }
    }

    queue_payload(
        &tx,
        &GitActivity {
            repository: "pulsewire/dashboard".to_string(),
            branch: Some("main".to_string()),
            author: Some("ci-bot".to_string()),
            sha: Some("9f1c2ab".to_string()),
            message: Some("Release run-1024".to_string()),
        },
    );
}
