//! Load-aware placement of stage jobs onto workers

use crate::error::{DistributedError, Result};
use crate::types::{Location, WorkerInfo};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;
use uuid::Uuid;

/// Hands out executor locations, always picking the worker with the fewest
/// jobs assigned so far.
///
/// Built from a snapshot of the worker registry, so a scheduler instance
/// plans one query and is owned by a single caller. Ties between equally
/// loaded workers go to the one registered first. Executor names carry a
/// random suffix so jobs of concurrent queries never share a name on a
/// worker.
pub struct PlacementScheduler {
    workers: Vec<WorkerInfo>,
    /// (assigned jobs, registration order)
    heap: BinaryHeap<Reverse<(usize, usize)>>,
    assigned: Vec<usize>,
}

impl PlacementScheduler {
    /// Create a scheduler over a registry snapshot, in registration order
    pub fn new(workers: Vec<WorkerInfo>) -> Self {
        let heap = (0..workers.len()).map(|i| Reverse((0, i))).collect();
        let assigned = vec![0; workers.len()];
        Self {
            workers,
            heap,
            assigned,
        }
    }

    pub fn has_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    /// Place one job on the least-loaded worker and name its executor
    pub fn allocate(&mut self) -> Result<Location> {
        let Reverse((count, idx)) = self
            .heap
            .pop()
            .ok_or(DistributedError::NoWorkersAvailable)?;

        let worker = &self.workers[idx];
        let name = format!("{}-{}", worker.name, Uuid::new_v4().simple());

        self.assigned[idx] = count + 1;
        self.heap.push(Reverse((count + 1, idx)));

        debug!(worker = %worker.name, executor = %name, load = count + 1, "Allocated executor");
        Ok(worker.executor_location(name))
    }

    /// Jobs assigned per worker, in registration order
    pub fn assigned_counts(&self) -> Vec<(String, usize)> {
        self.workers
            .iter()
            .zip(&self.assigned)
            .map(|(w, n)| (w.name.clone(), *n))
            .collect()
    }
}
