use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use confab_core::events::EngineEvent;
use confab_core::ids::ClientId;
use confab_engine::AgentDirectory;
use confab_store::Database;

use crate::client::{self, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::hub::SyncHub;
use crate::orchestrator::ConversationOrchestrator;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat: Duration,
    /// Clients silent for longer than this are dropped.
    pub client_timeout: Duration,
    pub unread_window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9200,
            max_send_queue: 256,
            heartbeat: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            unread_window: 500,
        }
    }
}

/// Engine pieces the server fronts.
pub struct Services {
    pub orchestrator: Arc<dyn ConversationOrchestrator>,
    pub directory: Arc<AgentDirectory>,
    pub db: Database,
    pub generator: String,
    pub events: broadcast::Receiver<EngineEvent>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub heartbeat: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, services: Services) -> Result<ServerHandle, std::io::Error> {
    let cancel = CancellationToken::new();
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let hub = Arc::new(SyncHub::new(Arc::clone(&client_registry), config.unread_window));

    let bridge = event_bridge::create_bridge(Arc::clone(&hub), services.events, cancel.clone());

    let cleanup_hub = Arc::clone(&hub);
    let cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        config.heartbeat,
        config.client_timeout,
        cancel.clone(),
        move |id| cleanup_hub.drop_client(id),
    );

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let handler_state = Arc::new(HandlerState {
        orchestrator: services.orchestrator,
        directory: services.directory,
        hub,
        db: services.db,
        generator: services.generator,
    });

    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
        cancel.clone(),
    ));

    let router = build_router(AppState {
        handler_state,
        client_registry,
        message_tx: msg_tx,
        heartbeat: config.heartbeat,
    });

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "confab server started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        tasks: vec![server, bridge, rpc, cleanup],
    })
}

/// Handle returned by `start()`. Dropping it leaves the tasks running;
/// call [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("confab server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.message_tx,
        state.heartbeat,
    )
    .await;

    state.handler_state.hub.drop_client(&client_id);
    tracing::info!(client_id = %client_id, "WebSocket client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, None, "health", &serde_json::json!({}), None).await;

    let healthy = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        == Some("healthy");

    let http_status = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(resp.result.unwrap_or_default()))
}

/// Process incoming RPC messages from WebSocket clients. Each request runs
/// on its own task so a slow invocation does not hold up the others.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => received,
        };
        let Some((client_id, raw_message)) = received else { break };

        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "unparseable frame");
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    let _ = registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        let _ = tokio::spawn(async move {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            let response =
                handlers::dispatch(&state, Some(&client_id), &request.method, &params, request.id).await;
            if !response.success {
                tracing::debug!(
                    method = %request.method,
                    code = response.error_code().unwrap_or_default(),
                    "rpc request failed"
                );
            }
            match serde_json::to_string(&response) {
                Ok(json) => {
                    let _ = registry.send_to(&client_id, json);
                }
                Err(e) => tracing::error!(error = %e, "failed to encode rpc response"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::EngineOrchestrator;
    use confab_engine::{AgentPool, ContextSources, ConversationManager, PoolConfig, StaticContextLoader};
    use confab_llm::MockGenerator;
    use confab_store::SqliteStore;

    fn services() -> Services {
        let db = Database::in_memory().unwrap();
        let store = Arc::new(SqliteStore::new(db.clone()));
        let (tx, rx) = broadcast::channel(64);
        let directory = Arc::new(AgentDirectory::new(store.clone()));
        let conversations = Arc::new(ConversationManager::new(store, tx));
        let pool = Arc::new(AgentPool::new(
            directory.clone(),
            conversations.clone(),
            ContextSources::uniform(Arc::new(StaticContextLoader::new())),
            Arc::new(MockGenerator::echo()),
            PoolConfig::default(),
        ));
        Services {
            orchestrator: Arc::new(EngineOrchestrator::new(conversations, directory.clone(), pool)),
            directory,
            db,
            generator: "mock".into(),
            events: rx,
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, services()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rpc_processor_answers_parse_errors() {
        let registry = Arc::new(ClientRegistry::new(8));
        let services = services();
        let state = Arc::new(HandlerState {
            orchestrator: services.orchestrator,
            directory: services.directory,
            hub: Arc::new(SyncHub::new(Arc::clone(&registry), 10)),
            db: services.db,
            generator: services.generator,
        });
        let (client_id, mut client_rx) = registry.register();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(process_rpc_messages(rx, state, registry, cancel.clone()));

        tx.send((client_id.clone(), "not json".into())).await.unwrap();
        let frame = client_rx.recv().await.unwrap();
        assert!(frame.contains("PARSE_ERROR"));

        tx.send((client_id, r#"{"method":"system.ping","id":7}"#.into())).await.unwrap();
        let frame: serde_json::Value = serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["success"], true);

        cancel.cancel();
        task.await.unwrap();
    }
}
