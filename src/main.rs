mod auth;
mod bookings;
mod conversations;
mod db;
mod error;
mod handlers;
mod listings;
mod models;
mod notifications;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gigmatch_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize database
    let pool = db::init_db().await.expect("Failed to initialize database");
    tracing::info!("Database initialized successfully");

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes requiring an authenticated actor
    let authed = Router::new()
        .route("/api/listings", post(listings::create_listing))
        .route("/api/listings/:id/request", post(bookings::request_booking))
        .route("/api/bookings/:id/respond", post(bookings::respond_booking))
        .route(
            "/api/conversations/start",
            post(conversations::start_conversation),
        )
        .route("/api/conversations", get(conversations::list_conversations))
        .route(
            "/api/conversations/:id/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route("/api/conversations/:id/read", post(conversations::mark_read))
        .route("/api/notifications/unread", get(notifications::unread_counts))
        .route_layer(middleware::from_fn_with_state(
            pool.clone(),
            auth::auth_middleware,
        ));

    // Build our application with routes
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/account/create", post(handlers::create_account))
        .route("/api/listings/:id", get(listings::listing_detail))
        .merge(authed)
        .layer(cors)
        .with_state(pool);

    // Get port from environment variable or use default
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
