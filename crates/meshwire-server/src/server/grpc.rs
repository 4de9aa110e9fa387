//! TaskService and StatusService gRPC implementations.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use meshwire_proto::v1::status_service_server::StatusService;
use meshwire_proto::v1::task_service_server::TaskService;
use meshwire_proto::v1::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, StatusReport,
    StatusResponse, StatusSubscribeRequest, SubscribeRequest, TaskFrame,
    UpdateTaskStatusRequest, UpdateTaskStatusResponse,
};

use crate::auth::JwtManager;
use crate::identity::TokenVerifier;
use crate::registry::SessionRegistry;
use crate::status::StatusHub;
use crate::storage::{StatusSnapshot, TaskStatus};
use crate::tasks::TaskBus;

/// Frames buffered per subscription before the bus sees backpressure.
const STREAM_BUFFER: usize = 32;

pub struct TaskGrpcService {
    registry: SessionRegistry,
    bus: TaskBus,
    verifier: TokenVerifier,
}

impl TaskGrpcService {
    pub fn new(registry: SessionRegistry, bus: TaskBus, verifier: TokenVerifier) -> Self {
        Self {
            registry,
            bus,
            verifier,
        }
    }
}

#[tonic::async_trait]
impl TaskService for TaskGrpcService {
    #[instrument(skip(self, request), fields(rpc = "Register"))]
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();

        if !self.verifier.verify(req.node_id, &req.token).await {
            warn!(node_id = req.node_id, "Registration with invalid credentials");
            return Err(Status::unauthenticated("invalid credentials"));
        }

        self.registry.register(req.node_id, req.token).await;
        info!(node_id = req.node_id, "Node registered");

        Ok(Response::new(RegisterResponse {
            success: true,
            message: "registration successful".into(),
        }))
    }

    type SubscribeTasksStream = ReceiverStream<Result<TaskFrame, Status>>;

    #[instrument(skip(self, request), fields(rpc = "SubscribeTasks"))]
    async fn subscribe_tasks(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeTasksStream>, Status> {
        let req = request.into_inner();

        if !self.verifier.verify(req.node_id, &req.token).await {
            return Err(Status::unauthenticated("invalid credentials"));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.registry
            .bind_stream(req.node_id, tx.clone())
            .await
            .map_err(|e| e.to_status())?;

        // Unbind when the subscriber goes away. A superseded stream
        // unbinding late is a no-op inside the registry.
        let registry = self.registry.clone();
        let node_id = req.node_id;
        tokio::spawn(async move {
            tx.closed().await;
            registry.unbind_stream(node_id, &tx).await;
        });

        info!(node_id = req.node_id, "Task stream bound");
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateTaskStatus"))]
    async fn update_task_status(
        &self,
        request: Request<UpdateTaskStatusRequest>,
    ) -> Result<Response<UpdateTaskStatusResponse>, Status> {
        let req = request.into_inner();

        let status = TaskStatus::parse(&req.status)
            .ok_or_else(|| Status::invalid_argument(format!("unknown status {:?}", req.status)))?;
        let error = if req.error.is_empty() {
            None
        } else {
            Some(req.error)
        };

        let task = self
            .bus
            .report_status(&req.task_id, status, error)
            .await
            .map_err(|e| e.to_status())?;

        self.registry.touch(task.node_id).await;

        Ok(Response::new(UpdateTaskStatusResponse {
            success: true,
            message: "task status updated".into(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "Heartbeat"))]
    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();

        if !self.verifier.verify(req.node_id, &req.token).await {
            return Err(Status::unauthenticated("invalid credentials"));
        }

        self.registry.touch(req.node_id).await;

        Ok(Response::new(HeartbeatResponse {
            success: true,
            message: "heartbeat received".into(),
        }))
    }
}

pub struct StatusGrpcService {
    hub: StatusHub,
    registry: SessionRegistry,
    verifier: TokenVerifier,
    jwt: JwtManager,
}

impl StatusGrpcService {
    pub fn new(
        hub: StatusHub,
        registry: SessionRegistry,
        verifier: TokenVerifier,
        jwt: JwtManager,
    ) -> Self {
        Self {
            hub,
            registry,
            verifier,
            jwt,
        }
    }
}

#[tonic::async_trait]
impl StatusService for StatusGrpcService {
    #[instrument(skip(self, request), fields(rpc = "ReportStatus"))]
    async fn report_status(
        &self,
        request: Request<StatusReport>,
    ) -> Result<Response<StatusResponse>, Status> {
        let observed_addr = request
            .remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        let req = request.into_inner();

        if !self.verifier.verify(req.node_id, &req.token).await {
            return Err(Status::unauthenticated("invalid credentials"));
        }

        let mut snapshot: StatusSnapshot = req
            .status
            .map(snapshot_from_proto)
            .ok_or_else(|| Status::invalid_argument("missing status snapshot"))?;
        snapshot.node_id = req.node_id;
        if snapshot.ip_address.is_empty() {
            snapshot.ip_address = observed_addr;
        }

        self.hub
            .report(req.node_id, snapshot)
            .await
            .map_err(|e| e.to_status())?;
        self.registry.touch(req.node_id).await;

        Ok(Response::new(StatusResponse {
            success: true,
            message: "status updated".into(),
        }))
    }

    type SubscribeStatusStream = ReceiverStream<Result<meshwire_proto::v1::StatusSnapshot, Status>>;

    #[instrument(skip(self, request), fields(rpc = "SubscribeStatus"))]
    async fn subscribe_status(
        &self,
        request: Request<StatusSubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStatusStream>, Status> {
        let req = request.into_inner();

        // Subscribers carry a dashboard session token, not a node token.
        self.jwt
            .validate(&req.token)
            .map_err(|_| Status::unauthenticated("invalid subscriber token"))?;

        let mut updates = self.hub.subscribe().await.map_err(|e| e.to_status())?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(snapshot) = updates.recv().await {
                if tx.send(Ok(snapshot_to_proto(snapshot))).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn snapshot_from_proto(s: meshwire_proto::v1::StatusSnapshot) -> StatusSnapshot {
    StatusSnapshot {
        node_id: s.node_id,
        hostname: s.hostname,
        ip_address: s.ip_address,
        cpu_percent: s.cpu_percent,
        memory_percent: s.memory_percent,
        disk_percent: s.disk_percent,
        uptime_secs: s.uptime_secs,
        active_tasks: s.active_tasks,
        status: s.status,
        version: s.version,
        reported_at: s.reported_at,
    }
}

fn snapshot_to_proto(s: StatusSnapshot) -> meshwire_proto::v1::StatusSnapshot {
    meshwire_proto::v1::StatusSnapshot {
        node_id: s.node_id,
        hostname: s.hostname,
        ip_address: s.ip_address,
        cpu_percent: s.cpu_percent,
        memory_percent: s.memory_percent,
        disk_percent: s.disk_percent,
        uptime_secs: s.uptime_secs,
        active_tasks: s.active_tasks,
        status: s.status,
        version: s.version,
        reported_at: s.reported_at,
    }
}
