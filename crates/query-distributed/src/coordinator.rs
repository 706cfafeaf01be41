//! Coordinator node: worker registry, query dispatch and job reports

use crate::channel::open_input;
use crate::error::{DistributedError, Result};
use crate::executor::wait_fired;
use crate::heartbeat::Heartbeat;
use crate::network::{request_ok, ControlRequest, NetworkConfig};
use crate::planner::{build_stage_graph, LogicalNode, StageGraph};
use crate::scheduler::PlacementScheduler;
use crate::types::{
    now_millis, ClusterConfig, JobStatus, Location, LogEntry, LogLevel, RuntimeConfig, TaskId,
    WorkerInfo,
};
use crate::wire::FrameReader;
use dashmap::DashMap;
use query_core::Row;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Registered worker with its registration order
#[derive(Debug, Clone)]
struct RegisteredWorker {
    info: WorkerInfo,
    seq: u64,
}

/// Latest known state of one executor
#[derive(Debug, Clone)]
pub struct JobReport {
    pub location: Location,
    pub task_id: TaskId,
    pub status: JobStatus,
    /// Time of the last heartbeat (or of dispatch, before the first one)
    pub last_seen_ms: u64,
    /// Every log entry received so far
    pub logs: Vec<LogEntry>,
}

impl JobReport {
    /// Check if the executor went silent while still active
    pub fn is_stale(&self, timeout_ms: u64) -> bool {
        !self.status.is_terminal() && now_millis().saturating_sub(self.last_seen_ms) > timeout_ms
    }

    /// Last error-level log message, if any
    pub fn last_error(&self) -> Option<&str> {
        self.logs
            .iter()
            .rev()
            .find(|l| l.level == LogLevel::Error)
            .map(|l| l.message.as_str())
    }
}

/// Aggregate status of a dispatched query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// No report received yet
    Pending,
    Running,
    Completed,
    Failed(String),
}

/// Coordinator node
pub struct Coordinator {
    config: ClusterConfig,
    network: NetworkConfig,
    /// Registered workers
    workers: DashMap<String, RegisteredWorker>,
    /// Job reports by executor name
    reports: DashMap<String, JobReport>,
    next_seq: AtomicU64,
}

impl Coordinator {
    /// Create a new coordinator
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            network: NetworkConfig::default(),
            workers: DashMap::new(),
            reports: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Use a custom network configuration
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Get configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Register a worker
    pub fn register_worker(&self, info: WorkerInfo) -> Result<()> {
        if self.workers.contains_key(&info.name) {
            return Err(DistributedError::WorkerAlreadyRegistered(info.name));
        }
        tracing::info!(
            "Registered worker {} at {}:{}",
            info.name,
            info.host,
            info.control_port
        );
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.workers
            .insert(info.name.clone(), RegisteredWorker { info, seq });
        Ok(())
    }

    /// Unregister a worker
    pub fn unregister_worker(&self, name: &str) -> Result<()> {
        if self.workers.remove(name).is_none() {
            return Err(DistributedError::WorkerNotFound(name.to_string()));
        }
        tracing::info!("Unregistered worker {}", name);
        Ok(())
    }

    /// Get a worker by name
    pub fn get_worker(&self, name: &str) -> Option<WorkerInfo> {
        self.workers.get(name).map(|w| w.info.clone())
    }

    /// List workers in registration order
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<RegisteredWorker> =
            self.workers.iter().map(|w| w.value().clone()).collect();
        workers.sort_by_key(|w| w.seq);
        workers.into_iter().map(|w| w.info).collect()
    }

    /// Get number of registered workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Placement scheduler over a snapshot of the current registry
    pub fn scheduler(&self) -> PlacementScheduler {
        PlacementScheduler::new(self.list_workers())
    }

    /// Lower a logical plan onto the registered workers
    pub fn plan(&self, plan: &dyn LogicalNode, parallelism: Option<usize>) -> Result<StageGraph> {
        let parallelism = parallelism.unwrap_or(self.config.default_parallelism);
        let mut scheduler = self.scheduler();
        build_stage_graph(plan, &mut scheduler, parallelism)
    }

    /// Deliver every job of `graph` and start it.
    ///
    /// Runs in phases so that every output listener exists before any
    /// reader dials it: accept all, set up writers, set up readers, run.
    pub async fn dispatch(&self, graph: &StageGraph, config: &RuntimeConfig) -> Result<()> {
        if config.coordinator.is_some() {
            let now = now_millis();
            for job in graph.jobs() {
                self.reports.insert(
                    job.location.name.clone(),
                    JobReport {
                        location: job.location.clone(),
                        task_id: job.task_id,
                        status: JobStatus::Todo,
                        last_seen_ms: now,
                        logs: Vec::new(),
                    },
                );
            }
        }

        for job in graph.jobs() {
            let request = ControlRequest::Accept {
                job: Box::new(job.clone()),
                config: config.clone(),
            };
            request_ok(&job.location.control_addr(), &request, &self.network).await?;
        }
        tracing::debug!("Query {} accepted by {} executors", config.query_id, graph.len());

        for job in graph.jobs() {
            let request = ControlRequest::SetupWriters {
                executor: job.location.name.clone(),
            };
            request_ok(&job.location.control_addr(), &request, &self.network).await?;
        }
        for job in graph.jobs() {
            let request = ControlRequest::SetupReaders {
                executor: job.location.name.clone(),
            };
            request_ok(&job.location.control_addr(), &request, &self.network).await?;
        }
        for job in graph.jobs() {
            let request = ControlRequest::Run {
                executor: job.location.name.clone(),
            };
            request_ok(&job.location.control_addr(), &request, &self.network).await?;
        }

        tracing::info!("Dispatched query {} ({} jobs)", config.query_id, graph.len());
        Ok(())
    }

    /// Accept heartbeat streams until `shutdown` fires
    pub async fn serve_heartbeats(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!("Coordinator receiving heartbeats on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                accepted = listener.accept() => self.on_heartbeat_connection(accepted),
                _ = wait_fired(&mut shutdown) => break,
            }
        }
        Ok(())
    }

    /// Spawn a reader for an accepted heartbeat stream. Accept errors are
    /// logged and the listener keeps serving.
    fn on_heartbeat_connection(self: &Arc<Self>, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => {
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = coordinator.receive_heartbeats(stream).await {
                        tracing::debug!("Heartbeat stream from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Heartbeat accept error: {}", e);
            }
        }
    }

    async fn receive_heartbeats(&self, stream: TcpStream) -> Result<()> {
        let mut frames = FrameReader::with_max_message_size(stream, self.network.max_message_size);
        while let Some(heartbeat) = frames.read_json::<Heartbeat>().await? {
            self.record_heartbeat(heartbeat);
        }
        Ok(())
    }

    /// Fold one heartbeat into the job report of its executor
    pub fn record_heartbeat(&self, heartbeat: Heartbeat) {
        let name = heartbeat.location.name.clone();
        let mut report = self.reports.entry(name).or_insert_with(|| JobReport {
            location: heartbeat.location.clone(),
            task_id: heartbeat.task_id,
            status: JobStatus::Todo,
            last_seen_ms: 0,
            logs: Vec::new(),
        });

        if report.status != heartbeat.status {
            tracing::debug!(
                "Executor {} moved {} -> {}",
                heartbeat.location.name,
                report.status,
                heartbeat.status
            );
        }
        report.location = heartbeat.location;
        report.task_id = heartbeat.task_id;
        report.status = heartbeat.status;
        report.last_seen_ms = now_millis();
        report.logs.extend(heartbeat.logs);
    }

    /// Get the latest report of one executor
    pub fn job_report(&self, executor: &str) -> Option<JobReport> {
        self.reports.get(executor).map(|r| r.clone())
    }

    /// Derive the status of the query behind `graph` from job reports
    pub fn query_status(&self, graph: &StageGraph) -> QueryStatus {
        let mut seen = 0;
        let mut succeeded = 0;
        for job in graph.jobs() {
            let Some(report) = self.reports.get(&job.location.name) else {
                continue;
            };
            seen += 1;
            match report.status {
                JobStatus::Error => {
                    let reason = report.last_error().unwrap_or("unknown error");
                    return QueryStatus::Failed(format!(
                        "executor {} failed: {}",
                        job.location.name, reason
                    ));
                }
                JobStatus::Succeed => succeeded += 1,
                _ => {
                    if report.is_stale(self.config.heartbeat_timeout_ms) {
                        return QueryStatus::Failed(format!(
                            "executor {} silent for more than {} ms",
                            job.location.name, self.config.heartbeat_timeout_ms
                        ));
                    }
                }
            }
        }

        if seen == 0 {
            QueryStatus::Pending
        } else if succeeded == graph.len() {
            QueryStatus::Completed
        } else {
            QueryStatus::Running
        }
    }

    /// Fail fast when a job of `graph` failed or went silent
    pub fn check_failures(&self, graph: &StageGraph) -> Result<()> {
        match self.query_status(graph) {
            QueryStatus::Failed(reason) => Err(DistributedError::QueryFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Read the final result from the sink, racing it against failure detection
    pub async fn fetch_results(&self, graph: &StageGraph, config: &RuntimeConfig) -> Result<Vec<Row>> {
        let (_stop, stop_rx) = watch::channel(false);
        let read = async {
            let mut reader = open_input(graph.sink_output(), config, &self.network, stop_rx).await?;
            reader.read_all().await
        };
        tokio::pin!(read);

        let mut poll = tokio::time::interval(Duration::from_millis(
            self.config.status_poll_interval_ms.max(1),
        ));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                rows = &mut read => {
                    return match rows {
                        Ok(rows) => {
                            tracing::info!("Query {} returned {} rows", config.query_id, rows.len());
                            Ok(rows)
                        }
                        Err(e) => {
                            // a failed upstream usually explains the broken stream better
                            self.check_failures(graph)?;
                            Err(e)
                        }
                    };
                }
                _ = poll.tick() => {
                    if let Err(e) = self.check_failures(graph) {
                        tracing::warn!("Query {} failed: {}", config.query_id, e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Plan, dispatch and collect one query
    pub async fn execute(
        &self,
        plan: &dyn LogicalNode,
        parallelism: Option<usize>,
        config: &RuntimeConfig,
    ) -> Result<Vec<Row>> {
        let graph = self.plan(plan, parallelism)?;
        self.dispatch(&graph, config).await?;
        self.fetch_results(&graph, config).await
    }

    /// Forget the reports of a finished query
    pub fn release(&self, graph: &StageGraph) {
        for job in graph.jobs() {
            self.reports.remove(&job.location.name);
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}
