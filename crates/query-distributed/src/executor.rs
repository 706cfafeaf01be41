//! Executor runtime: one executor owns and runs one stage job
//!
//! Lifecycle: `accept` retains the job, `setup_writers` and `setup_readers`
//! wire the data plane, `run` starts the operator on its own task and
//! returns. The status moves `TODO -> RUNNING -> {SUCCEED | ERROR}` and a
//! terminal status never changes again.

use crate::channel::{open_input, open_output};
use crate::error::{DistributedError, Result};
use crate::heartbeat::spawn_heartbeat;
use crate::job::StageJob;
use crate::network::NetworkConfig;
use crate::operators::{InputStream, OperatorRegistry, OutputStream, StageContext, StageOperator};
use crate::types::{JobStatus, Location, LogEntry, LogLevel, RuntimeConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Executor state shared with the operator task and the heartbeat task
pub type SharedState = Arc<Mutex<ExecutorState>>;

/// Status latch plus the append-only executor log
#[derive(Debug)]
pub struct ExecutorState {
    status: JobStatus,
    logs: Vec<LogEntry>,
    /// Bumped on every change
    version: u64,
    /// Last version delivered to the coordinator
    reported: u64,
}

/// Status and new log entries captured for one heartbeat
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    pub version: u64,
}

impl ExecutorState {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Todo,
            logs: Vec::new(),
            version: 0,
            reported: 0,
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// `TODO -> RUNNING`; false from any other status
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Todo {
            return false;
        }
        self.status = JobStatus::Running;
        self.touch();
        true
    }

    /// Latch SUCCEED unless a terminal status is already latched
    pub fn succeed(&mut self) -> bool {
        if self.status.is_terminal() {
            let message = format!("success reported after {}", self.status);
            self.log(LogLevel::Warn, message);
            return false;
        }
        self.status = JobStatus::Succeed;
        self.touch();
        true
    }

    /// Log the error and latch ERROR unless a terminal status is already
    /// latched
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Error, message);
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Error;
        self.touch();
        true
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry::new(level, message));
        self.touch();
    }

    /// Whether something changed since the last delivered heartbeat
    pub fn is_dirty(&self) -> bool {
        self.version != self.reported
    }

    /// Status plus log entries from `cursor` on
    pub fn snapshot(&self, cursor: usize) -> StateSnapshot {
        StateSnapshot {
            status: self.status,
            logs: self.logs.get(cursor..).unwrap_or_default().to_vec(),
            version: self.version,
        }
    }

    pub fn mark_reported(&mut self, version: u64) {
        self.reported = self.reported.max(version);
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

impl Default for ExecutorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until a lifecycle signal fires; a dropped sender counts as fired
pub(crate) async fn wait_fired(rx: &mut watch::Receiver<bool>) {
    loop {
        let fired = *rx.borrow_and_update();
        if fired || rx.changed().await.is_err() {
            return;
        }
    }
}

struct Accepted {
    job: StageJob,
    config: RuntimeConfig,
}

/// Runtime actor for one stage job
pub struct Executor {
    location: Location,
    registry: Arc<OperatorRegistry>,
    network: NetworkConfig,
    state: SharedState,
    accepted: Mutex<Option<Arc<Accepted>>>,
    writers: Mutex<Vec<OutputStream>>,
    readers: Mutex<Vec<InputStream>>,
    bridges: Mutex<Vec<JoinHandle<Result<()>>>>,
    /// Data locations of every output, once the writers are set up
    published: watch::Sender<Option<Arc<Vec<Location>>>>,
    /// Completion signal, fired exactly once
    done: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Create an executor in TODO
    pub fn new(location: Location, registry: Arc<OperatorRegistry>, network: NetworkConfig) -> Self {
        let (published, _) = watch::channel(None);
        let (done, _) = watch::channel(false);
        Self {
            location,
            registry,
            network,
            state: ExecutorState::shared(),
            accepted: Mutex::new(None),
            writers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
            published,
            done,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn name(&self) -> &str {
        &self.location.name
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.lock().logs().to_vec()
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Whether the completion signal fired
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Done, and the final heartbeat (if any) went out
    pub fn is_finished(&self) -> bool {
        self.is_done()
            && self
                .heartbeat
                .lock()
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true)
    }

    /// Validate and retain a job without starting it
    pub fn accept(&self, job: StageJob, config: RuntimeConfig) -> Result<()> {
        let result = self.accept_inner(job, config);
        self.record(result)
    }

    fn accept_inner(&self, job: StageJob, config: RuntimeConfig) -> Result<()> {
        if job.location.name != self.location.name {
            return Err(DistributedError::InvalidJob(format!(
                "job for {} delivered to {}",
                job.location.name, self.location.name
            )));
        }
        job.validate()?;
        if !self.registry.contains(job.tag()) {
            return Err(DistributedError::InvalidJob(format!(
                "no operator registered for {} jobs",
                job.tag()
            )));
        }

        let mut accepted = self.accepted.lock();
        if accepted.is_some() {
            return Err(DistributedError::InvalidJob(format!(
                "{} already holds a job",
                self.location.name
            )));
        }

        let message = format!("accepted {} job {}", job.tag(), job.task_id);
        if let Some(coordinator) = &config.coordinator {
            let handle = spawn_heartbeat(
                self.location.clone(),
                job.task_id,
                coordinator.clone(),
                config.heartbeat.clone(),
                self.state.clone(),
                self.done.subscribe(),
            );
            *self.heartbeat.lock() = Some(handle);
        }
        *accepted = Some(Arc::new(Accepted { job, config }));
        drop(accepted);

        self.log(LogLevel::Info, message);
        Ok(())
    }

    fn accepted(&self) -> Result<Arc<Accepted>> {
        self.accepted.lock().clone().ok_or_else(|| {
            DistributedError::InvalidJob(format!("{} has not accepted a job", self.location.name))
        })
    }

    /// Open one listener per output and publish their data locations
    pub async fn setup_writers(&self) -> Result<()> {
        let result = self.setup_writers_inner().await;
        self.record(result)
    }

    async fn setup_writers_inner(&self) -> Result<()> {
        let accepted = self.accepted()?;
        if self.published.borrow().is_some() {
            return Err(DistributedError::ChannelSetup(format!(
                "writers of {} already set up",
                self.location.name
            )));
        }

        let mut locations = Vec::with_capacity(accepted.job.outputs.len());
        let mut writers = Vec::with_capacity(accepted.job.outputs.len());
        let mut bridges = Vec::with_capacity(accepted.job.outputs.len());
        for output in &accepted.job.outputs {
            let channel = open_output(
                output.clone(),
                accepted.job.schema.clone(),
                &accepted.config,
                &self.network,
                self.done.subscribe(),
                self.state.clone(),
            )
            .await?;
            debug!(executor = %self.location.name, output = %channel.location, "Output listening");
            locations.push(channel.location);
            writers.push(channel.writer);
            bridges.push(channel.bridge);
        }

        *self.writers.lock() = writers;
        *self.bridges.lock() = bridges;
        self.log(
            LogLevel::Info,
            format!("listening on {} outputs", locations.len()),
        );
        self.published.send_replace(Some(Arc::new(locations)));
        Ok(())
    }

    /// Connect to every upstream output
    pub async fn setup_readers(&self) -> Result<()> {
        let result = self.setup_readers_inner().await;
        self.record(result)
    }

    async fn setup_readers_inner(&self) -> Result<()> {
        let accepted = self.accepted()?;
        let mut readers = Vec::with_capacity(accepted.job.inputs.len());
        for input in &accepted.job.inputs {
            let reader = open_input(input, &accepted.config, &self.network, self.done.subscribe()).await?;
            debug!(executor = %self.location.name, input = %input, "Input connected");
            readers.push(reader);
        }
        *self.readers.lock() = readers;
        self.log(
            LogLevel::Info,
            format!("connected to {} inputs", accepted.job.inputs.len()),
        );
        Ok(())
    }

    /// Data location of output `index`. Waits until the writers are set up,
    /// failing if the executor finishes first.
    pub async fn resolve_output_location(&self, index: usize) -> Result<Location> {
        let mut published = self.published.subscribe();
        let mut done = self.done.subscribe();
        loop {
            let current = published.borrow_and_update().clone();
            if let Some(locations) = current {
                return locations.get(index).cloned().ok_or_else(|| {
                    DistributedError::ChannelSetup(format!(
                        "{} has no output {}",
                        self.location.name, index
                    ))
                });
            }
            tokio::select! {
                changed = published.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wait_fired(&mut done) => break,
            }
        }
        Err(DistributedError::ChannelSetup(format!(
            "{} finished before publishing its outputs",
            self.location.name
        )))
    }

    /// Start the operator on its own task and return immediately
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let result = self.run_inner();
        self.record(result)
    }

    fn run_inner(self: &Arc<Self>) -> Result<()> {
        let accepted = self.accepted()?;
        let operator = self.registry.get(accepted.job.tag()).ok_or_else(|| {
            DistributedError::InvalidJob(format!(
                "no operator registered for {} jobs",
                accepted.job.tag()
            ))
        })?;

        let writers = std::mem::take(&mut *self.writers.lock());
        let readers = std::mem::take(&mut *self.readers.lock());
        if writers.len() != accepted.job.outputs.len() || readers.len() != accepted.job.inputs.len() {
            let message = format!(
                "channels not set up: {}/{} writers, {}/{} readers",
                writers.len(),
                accepted.job.outputs.len(),
                readers.len(),
                accepted.job.inputs.len()
            );
            *self.writers.lock() = writers;
            *self.readers.lock() = readers;
            return Err(DistributedError::ChannelSetup(message));
        }

        let started = self.state.lock().start();
        if !started {
            return Err(DistributedError::InvalidJob(format!(
                "{} cannot start from {}",
                self.location.name,
                self.status()
            )));
        }
        info!(executor = %self.location.name, kind = %accepted.job.tag(), "Stage job running");

        let bridges = std::mem::take(&mut *self.bridges.lock());
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor
                .execute(operator, accepted, readers, writers, bridges)
                .await;
        });
        Ok(())
    }

    async fn execute(
        &self,
        operator: Arc<dyn StageOperator>,
        accepted: Arc<Accepted>,
        readers: Vec<InputStream>,
        writers: Vec<OutputStream>,
        bridges: Vec<JoinHandle<Result<()>>>,
    ) {
        let mut ctx = StageContext::new(accepted.job.clone(), readers, writers, self.state.clone());
        let result = operator.execute(&mut ctx).await;
        let writers = ctx.into_outputs();

        let outcome = match result {
            Ok(()) => finish_outputs(writers, bridges).await,
            Err(e) => {
                abort_outputs(writers).await;
                Err(e)
            }
        };

        match outcome {
            Ok(()) => {
                if self.state.lock().succeed() {
                    info!(executor = %self.location.name, "Stage job succeeded");
                }
            }
            Err(e) => {
                error!(executor = %self.location.name, error = %e, "Stage job failed");
                self.state.lock().fail(e.to_string());
            }
        }
        self.fire_done();
    }

    /// Abort outstanding writers, finalize the status and fire completion.
    /// Safe to call any number of times.
    pub async fn clear(&self) {
        let writers = std::mem::take(&mut *self.writers.lock());
        abort_outputs(writers).await;
        self.readers.lock().clear();
        self.bridges.lock().clear();

        {
            let mut state = self.state.lock();
            if !state.status().is_terminal() {
                state.fail("cleared before completion");
            }
        }
        self.fire_done();
    }

    /// Wait for the completion signal
    pub async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        wait_fired(&mut rx).await;
    }

    fn fire_done(&self) {
        self.done.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(executor = %self.location.name, "{}", message),
            LogLevel::Warn => warn!(executor = %self.location.name, "{}", message),
            LogLevel::Error => error!(executor = %self.location.name, "{}", message),
        }
        self.state.lock().log(level, message);
    }

    /// Log a failed setup step without touching the status
    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.log(LogLevel::Error, e.to_string());
        }
        result
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

/// Close every writer (end-of-stream marker) and wait for the bridges to
/// deliver everything
async fn finish_outputs(writers: Vec<OutputStream>, bridges: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut writers = writers.into_iter();
    while let Some(mut writer) = writers.next() {
        if let Err(e) = writer.close().await {
            abort_outputs(writers.collect()).await;
            return Err(e);
        }
    }

    for bridge in bridges {
        match bridge.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(DistributedError::ChannelSetup(format!(
                    "output bridge task failed: {}",
                    e
                )))
            }
        }
    }
    Ok(())
}

/// Shut writers down without the end-of-stream marker
async fn abort_outputs(writers: Vec<OutputStream>) {
    for mut writer in writers {
        if let Err(e) = writer.abort().await {
            debug!(error = %e, "Aborting output failed");
        }
    }
}
