//! Data-plane wiring between executors
//!
//! Every output gets its own TCP listener on an ephemeral port. The operator
//! writes into an in-memory pipe and a bridge task copies the pipe into the
//! socket of the first reader that connects. Inputs resolve the upstream's
//! published data location over the control plane, dial it, and bridge the
//! socket into a pipe the operator reads from. Bridges stop when the owning
//! executor's completion signal fires.

use crate::error::{DistributedError, Result};
use crate::executor::{wait_fired, SharedState};
use crate::network::{resolve_output_location, NetworkConfig};
use crate::operators::{InputStream, OutputStream};
use crate::row_buffer::{RowsReader, RowsWriter};
use crate::types::{Location, LogLevel, RuntimeConfig};
use query_core::Schema;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A listening output, ready for its reader
pub struct OutputChannel {
    /// Published data location (actual port, channel index)
    pub location: Location,
    /// Operator side of the pipe
    pub writer: OutputStream,
    /// Accept loop plus pipe-to-socket copy
    pub bridge: JoinHandle<Result<()>>,
}

/// Listen for the reader of `output` and start its bridge
pub async fn open_output(
    output: Location,
    schema: Schema,
    config: &RuntimeConfig,
    network: &NetworkConfig,
    shutdown: watch::Receiver<bool>,
    state: SharedState,
) -> Result<OutputChannel> {
    let listener = TcpListener::bind((output.host.as_str(), 0))
        .await
        .map_err(|e| DistributedError::ChannelSetup(format!("cannot listen for {}: {}", output, e)))?;
    let location = Location {
        data_port: listener.local_addr()?.port(),
        ..output
    };

    let (operator_side, bridge_side) = tokio::io::duplex(config.pipe_capacity);
    let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(operator_side);
    let writer = RowsWriter::new(sink, schema, config.flush_threshold);

    let bridge = tokio::spawn(serve_output(
        listener,
        bridge_side,
        location.clone(),
        network.tcp_nodelay,
        shutdown,
        state,
    ));

    Ok(OutputChannel {
        location,
        writer,
        bridge,
    })
}

async fn serve_output(
    listener: TcpListener,
    pipe: DuplexStream,
    location: Location,
    nodelay: bool,
    mut shutdown: watch::Receiver<bool>,
    state: SharedState,
) -> Result<()> {
    let socket = tokio::select! {
        accepted = listener.accept() => {
            let (socket, peer) = accepted.map_err(|e| {
                DistributedError::ChannelSetup(format!("accept on {} failed: {}", location, e))
            })?;
            debug!(output = %location, %peer, "Reader connected");
            socket
        }
        _ = wait_fired(&mut shutdown) => {
            debug!(output = %location, "Output closed before a reader connected");
            return Ok(());
        }
    };
    socket.set_nodelay(nodelay)?;

    let refuser = tokio::spawn(refuse_extra(listener, location.clone(), shutdown.clone(), state));
    let result = copy_to_socket(pipe, socket, &mut shutdown).await;
    refuser.abort();
    result
}

/// Turn away every connection after the first
async fn refuse_extra(
    listener: TcpListener,
    location: Location,
    mut shutdown: watch::Receiver<bool>,
    state: SharedState,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    drop(socket);
                    warn!(output = %location, %peer, "Refused second reader");
                    state
                        .lock()
                        .log(LogLevel::Warn, format!("refused extra reader {} on {}", peer, location));
                }
                Err(e) => {
                    debug!(output = %location, error = %e, "Listener stopped");
                    return;
                }
            },
            _ = wait_fired(&mut shutdown) => return,
        }
    }
}

async fn copy_to_socket(
    mut pipe: DuplexStream,
    mut socket: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        copied = tokio::io::copy(&mut pipe, &mut socket) => {
            let bytes = copied?;
            socket.shutdown().await?;
            debug!(bytes, "Output bridge drained");
            Ok(())
        }
        _ = wait_fired(shutdown) => {
            Err(DistributedError::ChannelSetup("output bridge stopped by shutdown".to_string()))
        }
    }
}

/// Resolve, dial and bridge one upstream output
pub async fn open_input(
    input: &Location,
    config: &RuntimeConfig,
    network: &NetworkConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<InputStream> {
    let resolved = resolve_output_location(input, network).await?;
    if resolved.name != input.name || resolved.channel_index != input.channel_index {
        return Err(DistributedError::ChannelSetup(format!(
            "asked for {}, upstream answered {}",
            input, resolved
        )));
    }

    let socket = TcpStream::connect(resolved.data_addr())
        .await
        .map_err(|e| DistributedError::ChannelSetup(format!("cannot dial {}: {}", resolved, e)))?;
    socket.set_nodelay(network.tcp_nodelay)?;

    let (operator_side, bridge_side) = tokio::io::duplex(config.pipe_capacity);
    tokio::spawn(async move {
        if let Err(e) = copy_from_socket(socket, bridge_side, shutdown).await {
            debug!(input = %resolved, error = %e, "Input bridge ended early");
        }
    });

    let source: Box<dyn AsyncRead + Send + Unpin> = Box::new(operator_side);
    Ok(RowsReader::with_max_message_size(source, None, config.max_message_size)
        .with_max_batch_rows(config.flush_threshold))
}

async fn copy_from_socket(
    mut socket: TcpStream,
    mut pipe: DuplexStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        copied = tokio::io::copy(&mut socket, &mut pipe) => {
            copied?;
            pipe.shutdown().await?;
            Ok(())
        }
        _ = wait_fired(&mut shutdown) => Ok(()),
    }
}
