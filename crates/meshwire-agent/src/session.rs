//! The persistent coordinator session.
//!
//! State machine: connect -> register -> subscribe -> task loop. Dial
//! failures back off exponentially (100 ms doubling to a 5 s cap, five
//! attempts); a dropped stream sleeps five seconds and reconnects from
//! the top. Authentication failure is fatal: the token is wrong or the
//! node was deleted server-side, and retrying cannot fix either.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Code;
use tracing::{error, info, warn};

use meshwire_core::config::AgentConfig;
use meshwire_proto::v1::task_service_client::TaskServiceClient;
use meshwire_proto::v1::{RegisterRequest, SubscribeRequest, TaskFrame};

use crate::executor::TaskExecutor;

/// Frames queued for the sequential executor.
const TASK_QUEUE_CAPACITY: usize = 100;
/// Sleep before reconnecting after a dropped stream.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
/// Per-RPC deadline for register calls.
const REGISTER_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid credentials. Permanent; the session gives up.
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Exponential backoff policy for dial attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Build the coordinator endpoint with the session's keepalive and
/// timeout settings. Shared with the status reporter and executor so
/// every channel carries the same liveness behavior.
pub fn build_endpoint(config: &AgentConfig) -> Result<Endpoint, SessionError> {
    let mut endpoint = Channel::from_shared(config.grpc_address().to_string())
        .map_err(|e| SessionError::Connection(e.to_string()))?
        .connect_timeout(Duration::from_secs(10))
        .http2_keep_alive_interval(Duration::from_secs(5))
        .keep_alive_timeout(Duration::from_secs(3))
        .keep_alive_while_idle(true);

    if config.server.tls.enabled {
        let mut tls = ClientTlsConfig::new();
        if let Some(ca_path) = &config.server.tls.ca_cert {
            let ca_pem = std::fs::read_to_string(ca_path).map_err(|e| {
                SessionError::Connection(format!(
                    "failed to read CA cert {}: {e}",
                    ca_path.display()
                ))
            })?;
            tls = tls.ca_certificate(Certificate::from_pem(ca_pem));
        }
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| SessionError::Connection(e.to_string()))?;
    }

    Ok(endpoint)
}

/// The agent's persistent session to the coordinator.
pub struct AgentSession {
    config: AgentConfig,
    reconnect: ReconnectPolicy,
    executor: Arc<TaskExecutor>,
}

impl AgentSession {
    pub fn new(config: AgentConfig, executor: Arc<TaskExecutor>) -> Self {
        Self {
            config,
            reconnect: ReconnectPolicy::default(),
            executor,
        }
    }

    /// Run the session until shutdown or a fatal authentication error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let (task_tx, task_rx) = mpsc::channel::<TaskFrame>(TASK_QUEUE_CAPACITY);

        // One worker for the life of the session: tasks execute
        // sequentially even across reconnects.
        let executor = Arc::clone(&self.executor);
        let worker = tokio::spawn(async move {
            let mut task_rx = task_rx;
            while let Some(frame) = task_rx.recv().await {
                executor.execute(frame).await;
            }
        });

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            match self.connect_and_run(&task_tx, &mut shutdown).await {
                Ok(()) => {
                    info!("Session closed cleanly");
                    break Ok(());
                }
                Err(e @ SessionError::Auth(_)) => {
                    error!(error = %e, "Credentials rejected; giving up");
                    break Err(e);
                }
                Err(e) => {
                    warn!(error = %e, pause_secs = RECONNECT_PAUSE.as_secs(), "Session dropped; reconnecting");
                    tokio::select! {
                        _ = sleep(RECONNECT_PAUSE) => {}
                        _ = shutdown.changed() => break Ok(()),
                    }
                }
            }
        };

        drop(task_tx);
        let _ = worker.await;
        result
    }

    /// One full connect -> register -> subscribe -> receive cycle.
    async fn connect_and_run(
        &self,
        task_tx: &mpsc::Sender<TaskFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let channel = self.dial(shutdown).await?;
        let mut client = TaskServiceClient::new(channel);

        self.register(&mut client).await?;
        let mut stream = self.subscribe(&mut client).await?;

        info!(node_id = self.config.node_id, "Subscribed to task stream");

        loop {
            tokio::select! {
                message = stream.message() => {
                    match message {
                        Ok(Some(frame)) => {
                            if task_tx.send(frame).await.is_err() {
                                return Err(SessionError::Stream("task queue closed".into()));
                            }
                        }
                        Ok(None) => {
                            return Err(SessionError::Stream("stream ended by coordinator".into()));
                        }
                        Err(status) => match status.code() {
                            // The coordinator restarted and lost our
                            // session; re-register on this connection.
                            Code::NotFound => {
                                info!("Session lost server-side; re-registering");
                                self.register(&mut client).await?;
                                stream = self.subscribe(&mut client).await?;
                            }
                            Code::Unauthenticated => {
                                return Err(SessionError::Auth(status.message().to_string()));
                            }
                            _ => {
                                return Err(SessionError::Stream(status.to_string()));
                            }
                        },
                    }
                }
                _ = shutdown.changed() => {
                    info!("Session received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    /// Dial with bounded exponential backoff.
    async fn dial(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Channel, SessionError> {
        let mut attempt: u32 = 0;

        loop {
            match build_endpoint(&self.config)?.connect().await {
                Ok(channel) => {
                    info!(addr = %self.config.grpc_address(), "Connected to coordinator");
                    return Ok(channel);
                }
                Err(e) => {
                    if !self.reconnect.should_retry(attempt) {
                        return Err(SessionError::Connection(format!(
                            "dial failed after {attempt} retries: {e}"
                        )));
                    }
                    let delay = self.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Dial failed; backing off");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            return Err(SessionError::Connection("shutdown during dial".into()));
                        }
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn register(&self, client: &mut TaskServiceClient<Channel>) -> Result<(), SessionError> {
        let mut request = tonic::Request::new(RegisterRequest {
            node_id: self.config.node_id,
            token: self.config.token.clone(),
        });
        request.set_timeout(REGISTER_DEADLINE);

        let response = client.register(request).await.map_err(|status| {
            if status.code() == Code::Unauthenticated {
                SessionError::Auth(status.message().to_string())
            } else {
                SessionError::Registration(status.to_string())
            }
        })?;

        if !response.into_inner().success {
            return Err(SessionError::Registration("registration rejected".into()));
        }

        info!(node_id = self.config.node_id, "Registered with coordinator");
        Ok(())
    }

    async fn subscribe(
        &self,
        client: &mut TaskServiceClient<Channel>,
    ) -> Result<tonic::Streaming<TaskFrame>, SessionError> {
        let response = client
            .subscribe_tasks(SubscribeRequest {
                node_id: self.config.node_id,
                token: self.config.token.clone(),
            })
            .await
            .map_err(|status| match status.code() {
                Code::Unauthenticated => SessionError::Auth(status.message().to_string()),
                _ => SessionError::Stream(status.to_string()),
            })?;

        Ok(response.into_inner())
    }
}
