//! API server: HTTP routes and the Prometheus exporter.

use crate::context;
use crate::error;
use crate::rest::{self, AppState};
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use practice_core::config::{AppConfig, Environment};
use practice_platform::IsolationStack;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the router. Every `/v1` route runs behind the session context layer.
pub fn router(state: AppState, environment: Environment) -> Router {
    let v1 = Router::new()
        // Tenant-scoped records
        .route(
            "/v1/records/:table",
            get(rest::list_records).post(rest::create_record),
        )
        .route(
            "/v1/records/:table/:id",
            get(rest::get_record)
                .patch(rest::update_record)
                .delete(rest::delete_record),
        )
        .route("/v1/audit", get(rest::tenant_audit))
        // Platform administration (audited bypass)
        .route(
            "/v1/admin/records/:table",
            get(rest::admin_list_records).post(rest::admin_create_record),
        )
        .route("/v1/admin/audit/bypass", get(rest::bypass_events))
        .route("/v1/admin/coverage", get(rest::coverage))
        .route(
            "/v1/admin/tenants",
            get(rest::list_tenants).post(rest::onboard_tenant),
        )
        .route(
            "/v1/admin/tenants/:id/deactivate",
            post(rest::deactivate_tenant),
        )
        .route(
            "/v1/admin/tenants/:id/reactivate",
            post(rest::reactivate_tenant),
        )
        .route("/v1/admin/principals", post(rest::provision_principal))
        .route("/v1/admin/principals/:id/role", put(rest::change_role))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            context::session_context,
        ));

    let app = Router::new()
        .route("/health", get(rest::health_check))
        .merge(v1)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match environment {
        Environment::Development => app.layer(middleware::map_response(error::attach_detail)),
        Environment::Production => app,
    }
}

pub struct ApiServer {
    config: AppConfig,
    stack: Arc<IsolationStack>,
}

impl ApiServer {
    pub fn new(config: AppConfig, stack: Arc<IsolationStack>) -> Self {
        Self { config, stack }
    }

    pub fn state(&self) -> AppState {
        AppState {
            stack: self.stack.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state(), self.config.environment);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, environment = ?self.config.environment, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
