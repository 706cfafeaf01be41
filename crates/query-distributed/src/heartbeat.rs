//! Executor status reporting to the coordinator
//!
//! Each executor with a coordinator address runs one heartbeat task. It keeps
//! a long-lived stream open and sends a snapshot whenever the executor state
//! is dirty (fast tick) and unconditionally on the slow tick. When the
//! executor completes it sends a final snapshot and ends the stream. A broken
//! stream is reconnected after a fixed backoff, forever.

use crate::error::Result;
use crate::executor::{wait_fired, SharedState};
use crate::types::{HeartbeatConfig, JobStatus, Location, LogEntry, TaskId};
use crate::wire::FrameWriter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// One status report, carrying the log entries added since the previous one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub location: Location,
    pub status: JobStatus,
    pub task_id: TaskId,
    pub logs: Vec<LogEntry>,
}

/// Start the heartbeat task of one executor
pub fn spawn_heartbeat(
    location: Location,
    task_id: TaskId,
    coordinator: String,
    config: HeartbeatConfig,
    state: SharedState,
    done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let reporter = Reporter {
        location,
        task_id,
        coordinator,
        config,
        state,
        cursor: 0,
    };
    tokio::spawn(reporter.run(done))
}

struct Reporter {
    location: Location,
    task_id: TaskId,
    coordinator: String,
    config: HeartbeatConfig,
    state: SharedState,
    /// Log entries already delivered
    cursor: usize,
}

impl Reporter {
    async fn run(mut self, mut done: watch::Receiver<bool>) {
        loop {
            match self.stream(&mut done).await {
                Ok(()) => {
                    debug!(executor = %self.location.name, "Heartbeat stream finished");
                    return;
                }
                Err(e) => {
                    warn!(
                        executor = %self.location.name,
                        coordinator = %self.coordinator,
                        error = %e,
                        "Heartbeat stream failed, reconnecting"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
            }
        }
    }

    /// One connect-and-stream attempt; `Ok` once the final snapshot is sent
    async fn stream(&mut self, done: &mut watch::Receiver<bool>) -> Result<()> {
        let socket = TcpStream::connect(&self.coordinator).await?;
        socket.set_nodelay(true)?;
        let (_read_half, write_half) = socket.into_split();
        let mut frames = FrameWriter::new(write_half);

        let mut fast = tokio::time::interval(Duration::from_millis(self.config.fast_interval_ms.max(1)));
        fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut slow = tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        slow.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = fast.tick() => {
                    if self.state.lock().is_dirty() {
                        self.send(&mut frames).await?;
                    }
                }
                _ = slow.tick() => {
                    self.send(&mut frames).await?;
                }
                _ = wait_fired(done) => {
                    self.send(&mut frames).await?;
                    frames.close().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn send(&mut self, frames: &mut FrameWriter<OwnedWriteHalf>) -> Result<()> {
        let snapshot = self.state.lock().snapshot(self.cursor);
        let sent_logs = snapshot.logs.len();
        let heartbeat = Heartbeat {
            location: self.location.clone(),
            status: snapshot.status,
            task_id: self.task_id,
            logs: snapshot.logs,
        };
        frames.write_json(&heartbeat).await?;
        frames.flush().await?;

        self.cursor += sent_logs;
        self.state.lock().mark_reported(snapshot.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorState;
    use crate::types::LogLevel;
    use crate::wire::FrameReader;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            fast_interval_ms: 10,
            interval_ms: 1000,
            retry_backoff_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_dirty_state_reported_then_final_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = ExecutorState::shared();
        let (done_tx, done_rx) = watch::channel(false);
        let location = Location::new("w0-0", "127.0.0.1", 1, 2);

        let handle = spawn_heartbeat(location, TaskId::new(), addr, fast_config(), state.clone(), done_rx);
        let (socket, _) = listener.accept().await.unwrap();
        let mut frames = FrameReader::new(socket);

        let first: Heartbeat = frames.read_json().await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Todo);
        assert_eq!(first.location.name, "w0-0");

        {
            let mut s = state.lock();
            s.start();
            s.log(LogLevel::Info, "working");
        }
        let second: Heartbeat = timeout(Duration::from_secs(5), frames.read_json())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.status, JobStatus::Running);
        assert_eq!(second.logs.len(), 1);

        {
            let mut s = state.lock();
            s.succeed();
        }
        done_tx.send_replace(true);

        let mut last = None;
        while let Some(hb) = timeout(Duration::from_secs(5), frames.read_json::<Heartbeat>())
            .await
            .unwrap()
            .unwrap()
        {
            assert!(hb.logs.iter().all(|l| l.message != "working"));
            last = Some(hb);
        }
        assert_eq!(last.unwrap().status, JobStatus::Succeed);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = ExecutorState::shared();
        let (_done_tx, done_rx) = watch::channel(false);
        let config = HeartbeatConfig {
            fast_interval_ms: 5,
            interval_ms: 5,
            retry_backoff_ms: 5,
        };

        let handle = spawn_heartbeat(
            Location::new("w0-0", "127.0.0.1", 1, 2),
            TaskId::new(),
            addr,
            config,
            state,
            done_rx,
        );

        let (first, _) = listener.accept().await.unwrap();
        let mut frames = FrameReader::new(first);
        assert!(frames.read_json::<Heartbeat>().await.unwrap().is_some());
        drop(frames);

        let (second, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut frames = FrameReader::new(second);
        let hb: Heartbeat = timeout(Duration::from_secs(5), frames.read_json())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(hb.status, JobStatus::Todo);
        handle.abort();
    }
}
