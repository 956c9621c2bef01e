use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use punto_seguro_api::config::Config;
use punto_seguro_api::handlers::{self, AppState};
use punto_seguro_api::orchestrator::LeadOrchestrator;
use punto_seguro_api::verification::{LogSmsSender, MokaVerificationStore, PhoneVerifier};

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Storage backend (PostgreSQL when configured, JSON files otherwise).
/// - Email transport and phone verification.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    punto_seguro_api::obs::init_tracing();

    let config = Config::from_env()?;

    let repos = punto_seguro_api::data::open_repositories(&config).await?;
    let notifier = Arc::new(punto_seguro_api::integrations::build_notifier(&config)?);

    let orchestrator =
        LeadOrchestrator::new(repos.clone(), notifier, config.max_providers_per_lead);

    // OTP state: per (phone, ip), expiring on its own windows
    let verifier = PhoneVerifier::new(
        Arc::new(MokaVerificationStore::default()),
        Arc::new(LogSmsSender),
    );
    tracing::info!("Phone verification store initialized");

    let app_state = Arc::new(AppState {
        repos,
        orchestrator,
        verifier,
        config: config.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        // Public API
        .route("/api/score", post(handlers::score))
        .route("/api/leads", post(handlers::submit_lead))
        .route("/api/otp/send", post(handlers::otp_send))
        .route("/api/otp/verify", post(handlers::otp_verify))
        .route("/api/events", post(handlers::track_client_event))
        // Admin API
        .route(
            "/api/admin/providers",
            get(handlers::list_providers).post(handlers::create_provider),
        )
        .route(
            "/api/admin/providers/:id",
            put(handlers::update_provider).delete(handlers::delete_provider),
        )
        .route("/api/admin/leads", get(handlers::list_leads))
        .route(
            "/api/admin/leads/:id",
            get(handlers::get_lead).patch(handlers::patch_lead),
        )
        .route(
            "/api/admin/leads/:id/assign-manual",
            post(handlers::assign_manual),
        )
        .route(
            "/api/admin/leads/:id/reassign-auto",
            post(handlers::reassign_auto),
        )
        .route(
            "/api/admin/leads/:id/anonymize",
            post(handlers::anonymize_lead),
        )
        .route(
            "/api/admin/leads/:id/collaborator",
            post(handlers::set_lead_collaborator),
        )
        .route(
            "/api/admin/collaborators",
            get(handlers::list_collaborators).post(handlers::create_collaborator),
        )
        .route(
            "/api/admin/collaborators/:id",
            put(handlers::update_collaborator),
        )
        .route("/api/admin/events", get(handlers::list_events))
        .route("/api/admin/metrics", get(handlers::metrics))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
