//! Worker agent hosting executors behind a control-plane listener

use crate::error::{DistributedError, Result};
use crate::executor::{wait_fired, Executor};
use crate::network::{ControlRequest, ControlResponse, NetworkConfig};
use crate::operators::OperatorRegistry;
use crate::types::WorkerInfo;
use crate::wire::{FrameReader, FrameWriter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Worker node that runs stage jobs, one executor per job
pub struct Worker {
    info: WorkerInfo,
    registry: Arc<OperatorRegistry>,
    network: NetworkConfig,
    /// Executors by name
    executors: DashMap<String, Arc<Executor>>,
}

impl Worker {
    /// Create a new worker
    pub fn new(info: WorkerInfo, registry: OperatorRegistry) -> Self {
        Self {
            info,
            registry: Arc::new(registry),
            network: NetworkConfig::default(),
            executors: DashMap::new(),
        }
    }

    /// Use a custom network configuration
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Get worker info
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Look up an executor by name
    pub fn executor(&self, name: &str) -> Option<Arc<Executor>> {
        self.executors.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Get number of hosted executors
    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    /// Drop executors that completed and delivered their final report
    pub fn prune_finished(&self) -> usize {
        let before = self.executors.len();
        self.executors.retain(|_, e| !e.is_finished());
        let pruned = before.saturating_sub(self.executors.len());
        if pruned > 0 {
            tracing::debug!("Worker {} pruned {} finished executors", self.info.name, pruned);
        }
        pruned
    }

    /// Serve one control request
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => ControlResponse::Error(e.to_string()),
        }
    }

    async fn dispatch(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::Accept { job, config } => {
                let name = job.location.name.clone();
                match self.executors.entry(name.clone()) {
                    Entry::Occupied(_) => {
                        return Err(DistributedError::InvalidJob(format!(
                            "executor {} already exists on {}",
                            name, self.info.name
                        )));
                    }
                    Entry::Vacant(slot) => {
                        let executor = Executor::new(
                            job.location.clone(),
                            Arc::clone(&self.registry),
                            self.network.clone(),
                        );
                        executor.accept(*job, config)?;
                        slot.insert(Arc::new(executor));
                    }
                }
                tracing::info!("Worker {} accepted executor {}", self.info.name, name);
                Ok(ControlResponse::Ok)
            }
            ControlRequest::SetupWriters { executor } => {
                self.lookup(&executor)?.setup_writers().await?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::SetupReaders { executor } => {
                self.lookup(&executor)?.setup_readers().await?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::Run { executor } => {
                self.lookup(&executor)?.run()?;
                Ok(ControlResponse::Ok)
            }
            ControlRequest::ResolveOutputLocation {
                executor,
                channel_index,
            } => {
                let location = self
                    .lookup(&executor)?
                    .resolve_output_location(channel_index)
                    .await?;
                Ok(ControlResponse::Location(location))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<Executor>> {
        self.executor(name)
            .ok_or_else(|| DistributedError::ExecutorNotFound(name.to_string()))
    }

    /// Accept control connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            "Worker {} serving control plane on {}",
            self.info.name,
            listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => self.on_accept(accepted),
                _ = wait_fired(&mut shutdown) => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Spawn a handler for an accepted connection. Accept errors are logged
    /// and the listener keeps serving.
    fn on_accept(self: &Arc<Self>, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => {
                self.prune_finished();
                let worker = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = worker.handle_connection(stream).await {
                        tracing::warn!("Control connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Worker {} accept error: {}", self.info.name, e);
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(self.network.tcp_nodelay)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::with_max_message_size(read_half, self.network.max_message_size);
        let request: ControlRequest = match reader.read_json().await? {
            Some(request) => request,
            None => return Ok(()),
        };
        tracing::debug!("Worker {} handling request for {}", self.info.name, request.executor());

        let response = self.handle(request).await;
        let mut writer = FrameWriter::new(write_half);
        writer.write_json(&response).await?;
        writer.finish().await
    }

    /// Clear every hosted executor
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker {}", self.info.name);
        let executors: Vec<Arc<Executor>> = self.executors.iter().map(|e| Arc::clone(e.value())).collect();
        for executor in executors {
            executor.clear().await;
        }
    }
}
