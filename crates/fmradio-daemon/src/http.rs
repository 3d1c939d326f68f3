use crate::core::CoreEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use fmradio_proto::protocol::{Command, OutputMode, Preset, RadioState};
use fmradio_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<CoreEvent>) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/tune/:hz", post(tune))
        .route("/api/seek/up", post(seek_up))
        .route("/api/seek/down", post(seek_down))
        .route("/api/output/:mode", post(set_output))
        .route("/api/scan", post(start_scan).delete(cancel_scan))
        .route("/api/presets", get(get_presets))
        .route("/api/presets/:hz", put(set_preset).delete(remove_preset))
        .route("/api/presets/:hz/select", post(select_preset))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(CoreEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command to the core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

async fn get_state(State(state): State<HttpState>) -> Json<RadioState> {
    Json(state.state_manager.get_state().await)
}

async fn get_presets(State(state): State<HttpState>) -> Json<Vec<Preset>> {
    Json(state.state_manager.get_state().await.presets)
}

async fn tune(State(state): State<HttpState>, Path(hz): Path<u64>) -> StatusCode {
    send(&state, Command::Tune { hz }).await
}

async fn seek_up(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::SeekUp).await
}

async fn seek_down(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::SeekDown).await
}

async fn set_output(State(state): State<HttpState>, Path(mode): Path<String>) -> StatusCode {
    match mode.parse::<OutputMode>() {
        Ok(mode) => send(&state, Command::SetOutput { mode }).await,
        Err(e) => {
            info!("HTTP API: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn start_scan(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::StartScan).await
}

async fn cancel_scan(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::CancelScan).await
}

async fn set_preset(
    State(state): State<HttpState>,
    Path(hz): Path<u64>,
    name: String,
) -> StatusCode {
    let name = name.trim().to_string();
    send(&state, Command::SetPreset { hz, name }).await
}

async fn remove_preset(State(state): State<HttpState>, Path(hz): Path<u64>) -> StatusCode {
    send(&state, Command::RemovePreset { hz }).await
}

async fn select_preset(State(state): State<HttpState>, Path(hz): Path<u64>) -> StatusCode {
    send(&state, Command::SelectPreset { hz }).await
}
