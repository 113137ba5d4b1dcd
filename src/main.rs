use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use redis::Client as RedisClient;
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenancy_api::config::Config;
use tenancy_api::{db, routes, services, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = RedisClient::open(config.redis_url.as_str())?;
    redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    // The template schema must exist before any clone can happen; this is
    // idempotent and takes the synchronous bootstrap path.
    services::provisioner::create_tenant_schema(
        &pool,
        &redis_client,
        &config,
        &config.template_schema,
    )
    .await?;
    info!("Template schema \"{}\" ready", config.template_schema);

    services::provision_scheduler::start(pool.clone(), redis_client.clone(), config.clone());
    services::metrics::start(pool.clone());

    let state = AppState {
        db: pool,
        redis_client,
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-super-admin-key"),
        ]))
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Tenant registry
        .route(
            "/tenants",
            get(routes::tenants::list_tenants).post(routes::tenants::register_tenant),
        )
        .route(
            "/tenants/{schema_name}",
            get(routes::tenants::get_tenant).delete(routes::tenants::delete_tenant),
        )
        // Provisioning control
        .route("/provision/run", post(routes::tenants::trigger_provision_run))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("tenancy-api listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
