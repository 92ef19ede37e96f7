//! # Server Configuration
//!
//! Router assembly, shared state and the serve loop for chatlink.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::chat::{self, ChatService, ModelInvoker, StreamContext};
use crate::config::AppConfig;
use crate::connection_manager::ConnectionManager;
use crate::connectors::ProviderClients;
use crate::crypto::TokenCipher;
use crate::handlers;
use crate::repositories::{ChatRepository, ConnectionRepository, MessageRepository, StreamRepository};
use crate::telemetry::trace_context_middleware;

/// How often expiring provider tokens are refreshed in the background
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub connections: ConnectionManager,
    pub chat: ChatService,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl AppState {
    /// State wired from configuration alone
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        let clients = ProviderClients::from_config(&config);
        let invoker = chat::invoker_from_config(&config);
        let stream_context = StreamContext::from_config(&config);
        Self::from_parts(config, db, clients, invoker, stream_context)
    }

    /// State with explicit collaborators
    pub fn from_parts(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        clients: ProviderClients,
        invoker: Arc<dyn ModelInvoker>,
        stream_context: StreamContext,
    ) -> Self {
        let connections = ConnectionManager::new(
            ConnectionRepository::new(db.clone()),
            TokenCipher::new(config.encryption_key.clone()),
            clients,
        );
        let chat = ChatService::new(
            ChatRepository::new(db.clone()),
            MessageRepository::new(db.clone()),
            StreamRepository::new(db.clone()),
            invoker,
            Arc::new(stream_context),
            config.chat_models.clone(),
        );
        Self {
            config,
            db,
            connections,
            chat,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/connections", get(handlers::connections::list_connections))
        .route("/connections/initiate", post(handlers::connections::initiate))
        .route("/connections/callback", get(handlers::connections::callback))
        .route(
            "/connections/slack/initiate",
            post(handlers::connections::initiate_slack),
        )
        .route(
            "/connections/slack/callback",
            get(handlers::connections::slack_callback),
        )
        .route(
            "/connections/{provider}",
            get(handlers::connections::get_connection).delete(handlers::connections::delete_connection),
        )
        .route(
            "/chat",
            post(handlers::chat::post_chat).delete(handlers::chat::delete_chat),
        )
        .route("/chat/{id}/stream", get(handlers::chat::resume_stream));

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(handlers::health::healthz))
        .route("/ping", get(handlers::health::ping))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let state = AppState::new(config.clone(), Arc::new(db));

    let shutdown = CancellationToken::new();
    let refresher = tokio::spawn(
        state
            .connections
            .clone()
            .run_refresh_loop(TOKEN_REFRESH_INTERVAL, shutdown.clone()),
    );

    let app = create_app(state);

    // Resolve the configured bind address
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    let _ = refresher.await;
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_default();
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::connections::initiate,
        crate::handlers::connections::initiate_slack,
        crate::handlers::connections::callback,
        crate::handlers::connections::slack_callback,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::delete_connection,
        crate::handlers::chat::post_chat,
        crate::handlers::chat::resume_stream,
        crate::handlers::chat::delete_chat,
        crate::handlers::health::healthz,
        crate::handlers::health::ping,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::handlers::connections::InitiateRequest,
            crate::handlers::connections::InitiateResponse,
            crate::handlers::connections::DisconnectResponse,
            crate::handlers::health::HealthResponse,
            crate::repositories::ProviderStatus,
            crate::connectors::Provider,
            crate::chat::ChatRequest,
            crate::models::chat::Model,
            crate::models::Visibility,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "chatlink API",
        description = "Chat streaming and OAuth connection management",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
