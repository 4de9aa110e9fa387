//! Coordinator wiring: services, the combined listener, and shutdown.

mod grpc;
mod http;

pub use grpc::{StatusGrpcService, TaskGrpcService};
pub use http::{router, AppState};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use meshwire_core::config::ServerConfig;
use meshwire_proto::v1::status_service_server::StatusServiceServer;
use meshwire_proto::v1::task_service_server::TaskServiceServer;

use crate::auth::{jwt::DEFAULT_TTL_SECS, JwtManager};
use crate::confgen::ConfigGenerator;
use crate::identity::TokenVerifier;
use crate::registry::SessionRegistry;
use crate::status::StatusHub;
use crate::storage::Store;
use crate::tasks::TaskBus;

/// Terminal tasks older than this are swept.
const TASK_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Sweep cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The assembled coordinator.
pub struct MeshServer {
    state: AppState,
    hub: StatusHub,
}

impl MeshServer {
    pub fn new(config: &ServerConfig, store: Arc<dyn Store>) -> Self {
        let registry = SessionRegistry::new();
        let verifier = TokenVerifier::new(store.clone());
        let jwt = JwtManager::new(config.server.jwt.secret_key.as_bytes(), DEFAULT_TTL_SECS);
        let bus = TaskBus::new(store.clone(), registry.clone());
        let generator = ConfigGenerator::new(
            store.clone(),
            config.network.clone(),
            config.templates.clone(),
        );
        let hub = StatusHub::new(store.clone());

        let state = AppState {
            store,
            bus,
            generator,
            registry,
            verifier,
            jwt,
        };

        Self { state, hub }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The full application router: gRPC services (plus reflection) and
    /// the HTTP API on one listener. hyper's protocol detection
    /// separates HTTP/2 gRPC frames from HTTP/1 requests per
    /// connection.
    pub fn into_router(self) -> anyhow::Result<axum::Router> {
        let task_svc = TaskGrpcService::new(
            self.state.registry.clone(),
            self.state.bus.clone(),
            self.state.verifier.clone(),
        );
        let status_svc = StatusGrpcService::new(
            self.hub,
            self.state.registry.clone(),
            self.state.verifier.clone(),
            self.state.jwt.clone(),
        );
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(meshwire_proto::v1::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let mut grpc = tonic::service::RoutesBuilder::default();
        grpc.add_service(TaskServiceServer::new(task_svc));
        grpc.add_service(StatusServiceServer::new(status_svc));
        grpc.add_service(reflection);

        Ok(grpc.routes().into_axum_router().merge(router(self.state)))
    }

    /// Bind and serve until the shutdown signal flips.
    pub async fn serve(
        self,
        addr: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let state = self.state.clone();

        // Hourly retention sweep for terminal tasks.
        let mut sweeper_shutdown = shutdown.clone();
        let bus = state.bus.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = bus.cleanup(TASK_RETENTION.as_secs() as i64).await {
                            warn!(error = %e, "Task retention sweep failed");
                        }
                    }
                    _ = sweeper_shutdown.changed() => break,
                }
            }
        });

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr, "Coordinator listening");

        let app = self.into_router()?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
                info!("Draining in-flight requests");
            })
            .await?;

        state.store.close().await;
        info!("Coordinator stopped");
        Ok(())
    }
}
