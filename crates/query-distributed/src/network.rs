//! Control-plane messages and the request/response client
//!
//! Each request travels on its own TCP connection: one JSON frame each way,
//! using the same framing as the data plane.

use crate::error::{DistributedError, Result};
use crate::job::StageJob;
use crate::types::{Location, RuntimeConfig};
use crate::wire::{FrameReader, FrameWriter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

/// Requests served by a worker on behalf of its executors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Create an executor for `job` and retain it without starting it
    Accept {
        job: Box<StageJob>,
        config: RuntimeConfig,
    },
    /// Open the data-plane listeners of an executor
    SetupWriters { executor: String },
    /// Connect an executor to its upstream outputs
    SetupReaders { executor: String },
    /// Start the executor's operator
    Run { executor: String },
    /// Where a downstream reader finds output `channel_index`; answered
    /// once the executor's writers are set up
    ResolveOutputLocation {
        executor: String,
        channel_index: usize,
    },
}

impl ControlRequest {
    /// Executor the request is about
    pub fn executor(&self) -> &str {
        match self {
            ControlRequest::Accept { job, .. } => &job.location.name,
            ControlRequest::SetupWriters { executor }
            | ControlRequest::SetupReaders { executor }
            | ControlRequest::Run { executor }
            | ControlRequest::ResolveOutputLocation { executor, .. } => executor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Location(Location),
    Error(String),
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum control message size in bytes
    pub max_message_size: usize,
    /// Disable Nagle on control and data connections
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024, // 64 MB
            tcp_nodelay: true,
        }
    }
}

/// Send one request to the worker at `addr` and wait for its answer.
///
/// An error answer is turned into [`DistributedError::Remote`].
pub async fn send_request(
    addr: &str,
    request: &ControlRequest,
    config: &NetworkConfig,
) -> Result<ControlResponse> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        DistributedError::ChannelSetup(format!("cannot reach control plane at {}: {}", addr, e))
    })?;
    stream.set_nodelay(config.tcp_nodelay)?;
    let (read_half, write_half) = stream.into_split();

    let mut writer = FrameWriter::new(write_half);
    writer.write_json(request).await?;
    writer.finish().await?;

    let mut reader = FrameReader::with_max_message_size(read_half, config.max_message_size);
    let response: ControlResponse = reader.read_json().await?.ok_or_else(|| {
        DistributedError::Truncated(format!("{} closed without answering", addr))
    })?;
    debug!(addr, executor = request.executor(), response = ?response, "Control request answered");

    match response {
        ControlResponse::Error(msg) => Err(DistributedError::Remote(msg)),
        other => Ok(other),
    }
}

/// Send a request that must be answered with `Ok`
pub async fn request_ok(addr: &str, request: &ControlRequest, config: &NetworkConfig) -> Result<()> {
    match send_request(addr, request, config).await? {
        ControlResponse::Ok => Ok(()),
        other => Err(DistributedError::Remote(format!(
            "unexpected answer {:?}",
            other
        ))),
    }
}

/// Ask the upstream executor behind `output` for its published data location
pub async fn resolve_output_location(output: &Location, config: &NetworkConfig) -> Result<Location> {
    let request = ControlRequest::ResolveOutputLocation {
        executor: output.name.clone(),
        channel_index: output.channel_index,
    };
    match send_request(&output.control_addr(), &request, config).await? {
        ControlResponse::Location(location) => Ok(location),
        other => Err(DistributedError::Remote(format!(
            "expected a location for {}, got {:?}",
            output, other
        ))),
    }
}
