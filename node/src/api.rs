//! # REST + WebSocket API
//!
//! The surface a UI drives one device through. All handlers share
//! [`AppState`] via axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                       | Description                          |
//! |--------|----------------------------|--------------------------------------|
//! | GET    | `/health`                  | Liveness probe                       |
//! | GET    | `/status`                  | Device summary                       |
//! | GET    | `/transfers`               | Active transfer records              |
//! | POST   | `/transfers`               | Offer our seat to a peer             |
//! | POST   | `/transfers/:id/confirm`   | Accept or decline a pending transfer |
//! | DELETE | `/transfers/finished`      | Drop rejected records                |
//! | GET    | `/points`                  | Balance and transfer count           |
//! | POST   | `/points/spend`            | Spend points                         |
//! | GET    | `/rewards`                 | Reward catalog                       |
//! | POST   | `/rewards/:reward/redeem`  | Redeem a reward                      |
//! | GET    | `/thanks`                  | Thank-you messages                   |
//! | DELETE | `/thanks`                  | Clear thank-you messages             |
//! | GET    | `/settings`                | Preferences                          |
//! | PUT    | `/settings`                | Replace preferences                  |
//! | PUT    | `/mode`                    | Switch user mode                     |
//! | GET    | `/ws`                      | Push stream of device events         |
//! | GET    | `/metrics`                 | Prometheus metrics                   |
//! | POST   | `/test/inject`             | Synthetic request (opt-in)           |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use seatpass_protocol::ledger::LedgerError;
use seatpass_protocol::storage::Settings;
use seatpass_protocol::transfer::new_transfer_id;
use seatpass_protocol::{DeviceStatus, Reward, SeatDevice, SimulatedRegistry, UserMode};

use crate::metrics::{self, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Reported software version.
    pub version: String,
    pub device: Arc<SeatDevice>,
    pub metrics: SharedMetrics,
    /// Set when `/test/inject` is enabled.
    pub registry: Option<Arc<SimulatedRegistry>>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/transfers", get(list_transfers).post(initiate_transfer))
        .route("/transfers/finished", delete(clear_finished))
        .route("/transfers/:id/confirm", post(confirm_transfer))
        .route("/points", get(points_handler))
        .route("/points/spend", post(spend_points))
        .route("/rewards", get(rewards_handler))
        .route("/rewards/:reward/redeem", post(redeem_reward))
        .route("/thanks", get(list_thanks).delete(clear_thanks))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/mode", put(put_mode))
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics::metrics_handler));

    if state.registry.is_some() {
        router = router.route("/test/inject", post(inject_test_request));
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub device: DeviceStatus,
    /// RFC 3339 time of the response.
    pub timestamp: String,
}

/// Body of `POST /transfers`.
#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub peer_id: String,
    /// Defaults to the `user_type` preference.
    #[serde(default)]
    pub receiver_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitiateResponse {
    pub transfer_id: String,
}

/// Body of `POST /transfers/:id/confirm`.
#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub confirmed: bool,
}

/// Body of `POST /points/spend`.
#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: u64,
}

/// One entry of `GET /rewards`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RewardInfo {
    pub reward: Reward,
    pub cost: u64,
    /// Whether the current balance covers it.
    pub available: bool,
}

/// Body of `PUT /mode`.
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: UserMode,
}

/// Body of `POST /test/inject`.
#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    #[serde(default)]
    pub transfer_id: Option<String>,
    #[serde(default = "default_inject_type")]
    pub receiver_type: String,
}

fn default_inject_type() -> String {
    "pregnant".to_string()
}

/// Error body for every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version.clone(),
        device: state.device.status(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /transfers`
async fn list_transfers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.active_transfers())
}

/// `POST /transfers`
async fn initiate_transfer(
    State(state): State<AppState>,
    Json(req): Json<InitiateRequest>,
) -> Response {
    let peer_id = req.peer_id.trim();
    if peer_id.is_empty() {
        return error(StatusCode::BAD_REQUEST, "peer_id must not be empty");
    }
    if peer_id == state.device.device_id() {
        return error(StatusCode::BAD_REQUEST, "cannot offer a seat to ourselves");
    }
    let receiver_type = req
        .receiver_type
        .unwrap_or_else(|| state.device.settings().user_type);
    let transfer_id = state.device.initiate_transfer(peer_id, &receiver_type);
    (StatusCode::CREATED, Json(InitiateResponse { transfer_id })).into_response()
}

/// `POST /transfers/:id/confirm`
async fn confirm_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    if state.device.confirm(&id, req.confirmed) {
        match state.device.transfers().get(&id) {
            Some(record) => Json(record).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        }
    } else if state.device.transfers().get(&id).is_none() {
        error(StatusCode::NOT_FOUND, format!("unknown transfer: {id}"))
    } else {
        error(StatusCode::CONFLICT, format!("transfer {id} is not pending"))
    }
}

/// `DELETE /transfers/finished`
async fn clear_finished(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.device.clear_finished();
    Json(serde_json::json!({ "removed": removed }))
}

/// `GET /points`
async fn points_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.points())
}

/// `POST /points/spend`
async fn spend_points(State(state): State<AppState>, Json(req): Json<SpendRequest>) -> Response {
    if state.device.spend(req.amount) {
        Json(BalanceResponse {
            balance: state.device.points().total_points,
        })
        .into_response()
    } else {
        error(
            StatusCode::CONFLICT,
            format!(
                "insufficient points: have {}, need {}",
                state.device.points().total_points,
                req.amount
            ),
        )
    }
}

/// `GET /rewards`
async fn rewards_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.device.ledger();
    let catalog: Vec<RewardInfo> = Reward::ALL
        .into_iter()
        .map(|reward| RewardInfo {
            reward,
            cost: reward.cost(),
            available: ledger.can_redeem(reward),
        })
        .collect();
    Json(catalog)
}

/// `POST /rewards/:reward/redeem`
async fn redeem_reward(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let reward: Reward = match name.parse() {
        Ok(r) => r,
        Err(e) => return error(StatusCode::NOT_FOUND, e.to_string()),
    };
    match state.device.redeem(reward) {
        Ok(balance) => Json(BalanceResponse { balance }).into_response(),
        Err(e @ LedgerError::InsufficientPoints { .. }) => {
            error(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, %reward, "redeem failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `GET /thanks`
async fn list_thanks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.thank_you_messages())
}

/// `DELETE /thanks`
async fn clear_thanks(State(state): State<AppState>) -> impl IntoResponse {
    state.device.clear_thank_you_messages();
    StatusCode::NO_CONTENT
}

/// `GET /settings`
async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.settings())
}

/// `PUT /settings`
async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> impl IntoResponse {
    state.device.update_settings(settings);
    Json(state.device.settings())
}

/// `PUT /mode`
async fn put_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> impl IntoResponse {
    state.device.set_mode(req.mode);
    Json(state.device.status())
}

/// `POST /test/inject`
async fn inject_test_request(
    State(state): State<AppState>,
    Json(req): Json<InjectRequest>,
) -> Response {
    let Some(registry) = state.registry.as_ref() else {
        return error(StatusCode::NOT_FOUND, "test routes disabled");
    };
    let transfer_id = req.transfer_id.unwrap_or_else(new_transfer_id);
    registry.inject_test_request(&transfer_id, &req.receiver_type);
    (StatusCode::ACCEPTED, Json(InitiateResponse { transfer_id })).into_response()
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `GET /ws`: pushes every [`seatpass_protocol::DeviceEvent`] as JSON text.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.device.subscribe_events();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize ws event");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "ws subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    // Push-only; inbound frames are ignored.
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use seatpass_protocol::discovery::DiscoveryEvent;
    use seatpass_protocol::storage::MemoryStore;
    use seatpass_protocol::transfer::{TransferRequest, TransferStatus};
    use seatpass_protocol::{system_clock, PointsSnapshot, ProtocolConfig, SimulatedTransport};
    use tower::ServiceExt;

    fn test_state(with_registry: bool) -> AppState {
        let clock = system_clock();
        let registry = Arc::new(SimulatedRegistry::new(clock.clone()));
        let device = SeatDevice::new(
            Arc::new(SimulatedTransport::new(registry.clone())),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            clock,
            ProtocolConfig::default(),
        )
        .expect("device");
        AppState {
            version: "0.1.0-test".into(),
            device: Arc::new(device),
            metrics: Arc::new(crate::metrics::NodeMetrics::new().expect("metrics")),
            registry: with_registry.then_some(registry),
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(path);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let resp = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, bytes)
    }

    fn incoming(state: &AppState, id: &str) {
        state
            .device
            .handle_discovery_event(DiscoveryEvent::RequestReceived {
                transfer_id: id.into(),
                sender_id: "GIVER".into(),
                receiver_type: "pregnant".into(),
            });
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let router = create_router(test_state(false));
        let (status, body) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_device() {
        let state = test_state(false);
        let id = state.device.device_id().to_string();
        let router = create_router(state);
        let (status, body) = send(&router, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["device_id"], id);
        assert_eq!(json["version"], "0.1.0-test");
        assert_eq!(json["active_transfers"], 0);
    }

    #[tokio::test]
    async fn initiate_creates_outgoing_record() {
        let state = test_state(false);
        let router = create_router(state.clone());
        let (status, body) = send(
            &router,
            "POST",
            "/transfers",
            Some(serde_json::json!({ "peer_id": "SEEKER", "receiver_type": "elderly" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let resp: InitiateResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.transfer_id.len(), 16);

        let (_, body) = send(&router, "GET", "/transfers", None).await;
        let list: Vec<TransferRequest> = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].receiver_device_id, "SEEKER");
        assert_eq!(list[0].receiver_type, "elderly");
    }

    #[tokio::test]
    async fn initiate_rejects_empty_peer() {
        let router = create_router(test_state(false));
        let (status, _) = send(
            &router,
            "POST",
            "/transfers",
            Some(serde_json::json!({ "peer_id": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn confirm_answers_pending_then_conflicts() {
        let state = test_state(false);
        incoming(&state, "t-1");
        let router = create_router(state);

        let (status, body) = send(
            &router,
            "POST",
            "/transfers/t-1/confirm",
            Some(serde_json::json!({ "confirmed": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let record: TransferRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.status, TransferStatus::Rejected);

        let (status, _) = send(
            &router,
            "POST",
            "/transfers/t-1/confirm",
            Some(serde_json::json!({ "confirmed": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&router, "DELETE", "/transfers/finished", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["removed"], 1);
    }

    #[tokio::test]
    async fn confirm_unknown_is_not_found() {
        let router = create_router(test_state(false));
        let (status, _) = send(
            &router,
            "POST",
            "/transfers/nope/confirm",
            Some(serde_json::json!({ "confirmed": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn spend_and_redeem_respect_balance() {
        let state = test_state(false);
        for _ in 0..8 {
            state.device.ledger().add_points(50);
        }
        let router = create_router(state);

        let (status, body) = send(
            &router,
            "POST",
            "/points/spend",
            Some(serde_json::json!({ "amount": 50 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let resp: BalanceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.balance, 350);

        let (status, body) = send(&router, "POST", "/rewards/cafe-discount/redeem", None).await;
        assert_eq!(status, StatusCode::OK);
        let resp: BalanceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.balance, 50);

        let (status, _) = send(&router, "POST", "/rewards/transit_charge/redeem", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&router, "POST", "/rewards/free-lunch/redeem", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            "POST",
            "/points/spend",
            Some(serde_json::json!({ "amount": 51 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(&router, "GET", "/points", None).await;
        let points: PointsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(points.total_points, 50);
        assert_eq!(points.total_transfers, 8);
    }

    #[tokio::test]
    async fn rewards_catalog_reflects_balance() {
        let state = test_state(false);
        for _ in 0..6 {
            state.device.ledger().add_points(50);
        }
        let router = create_router(state);
        let (_, body) = send(&router, "GET", "/rewards", None).await;
        let catalog: Vec<RewardInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(catalog.len(), 3);
        assert!(catalog[0].available);
        assert!(!catalog[1].available);
    }

    #[tokio::test]
    async fn thanks_list_and_clear() {
        let state = test_state(false);
        incoming(&state, "t-2");
        assert!(state.device.confirm("t-2", true));
        let router = create_router(state);

        let (_, body) = send(&router, "GET", "/thanks", None).await;
        let list: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["transfer_id"], "t-2");

        let (status, _) = send(&router, "DELETE", "/thanks", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&router, "GET", "/thanks", None).await;
        let list: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn mode_switch_is_reflected_in_status() {
        let router = create_router(test_state(false));
        let (status, body) = send(
            &router,
            "PUT",
            "/mode",
            Some(serde_json::json!({ "mode": "need_seat" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mode"], "need_seat");
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let router = create_router(test_state(false));
        let (_, body) = send(&router, "GET", "/settings", None).await;
        let mut settings: Settings = serde_json::from_slice(&body).unwrap();
        assert!(settings.auto_confirm);

        settings.auto_confirm = false;
        settings.user_type = "injured".into();
        let (status, body) = send(
            &router,
            "PUT",
            "/settings",
            Some(serde_json::to_value(&settings).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let back: Settings = serde_json::from_slice(&body).unwrap();
        assert_eq!(back, settings);
    }

    #[tokio::test]
    async fn test_route_only_when_enabled() {
        let router = create_router(test_state(false));
        let (status, _) = send(
            &router,
            "POST",
            "/test/inject",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = test_state(true);
        let registry = state.registry.clone().unwrap();
        let router = create_router(state);
        let (status, body) = send(
            &router,
            "POST",
            "/test/inject",
            Some(serde_json::json!({ "transfer_id": "inj-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let resp: InitiateResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.transfer_id, "inj-1");
        assert_eq!(registry.message_count(), 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        let state = test_state(false);
        state.device.ledger().add_points(50);
        let router = create_router(state);
        let (status, body) = send(&router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("seatpass_points_balance 50"));
    }
}
