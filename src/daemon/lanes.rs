//! Per-(entity, key) lanes over a fixed worker pool.
//!
//! Jobs of one entity queue in submission order. A job starts when nothing
//! ahead of it holds its key: the same key still queued or running, or a
//! barrier (management or universal key). A barrier starts only once every
//! earlier job of the entity has finished, and blocks everything behind it.
//! Jobs of different entities never wait on each other.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};

use crate::core::{ConcurrencyKey, EntityError, EntityId};
use crate::daemon::metrics;

pub type JobFn = Box<dyn FnOnce() + Send>;
pub type CancelFn = Box<dyn FnOnce(EntityError) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobClass {
    Regular,
    /// Starts a new incarnation; destroy cancellation stops here.
    Create,
    /// Passive sync work; never cancelled.
    Sync,
}

pub struct LaneJob {
    pub entity: EntityId,
    pub key: ConcurrencyKey,
    pub class: JobClass,
    pub run: JobFn,
    /// Invoked instead of `run` when the job is cancelled or rejected.
    pub cancel: CancelFn,
}

impl LaneJob {
    pub fn new(
        entity: EntityId,
        key: ConcurrencyKey,
        class: JobClass,
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce(EntityError) + Send + 'static,
    ) -> Self {
        Self {
            entity,
            key,
            class,
            run: Box::new(run),
            cancel: Box::new(cancel),
        }
    }
}

struct Ready {
    entity: EntityId,
    key: ConcurrencyKey,
    run: JobFn,
}

enum WorkerMsg {
    Run(Ready),
    Stop,
}

#[derive(Default)]
struct EntityLanes {
    pending: VecDeque<LaneJob>,
    running: HashSet<ConcurrencyKey>,
}

impl EntityLanes {
    /// Pops every job that may start now, preserving queue order.
    fn take_runnable(&mut self) -> Vec<LaneJob> {
        let mut out = Vec::new();
        if self.running.iter().any(|key| key.is_barrier()) {
            return out;
        }
        let mut blocked: HashSet<ConcurrencyKey> = HashSet::new();
        let mut index = 0;
        while index < self.pending.len() {
            let key = self.pending[index].key;
            if key.is_barrier() {
                if index == 0 && self.running.is_empty() {
                    if let Some(job) = self.pending.pop_front() {
                        self.running.insert(key);
                        out.push(job);
                    }
                }
                break;
            }
            if self.running.contains(&key) || blocked.contains(&key) {
                blocked.insert(key);
                index += 1;
                continue;
            }
            if let Some(job) = self.pending.remove(index) {
                self.running.insert(key);
                out.push(job);
            }
        }
        out
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

#[derive(Default)]
struct LaneState {
    entities: HashMap<EntityId, EntityLanes>,
    queued: usize,
    closed: bool,
}

struct LaneShared {
    state: Mutex<LaneState>,
    ready_tx: Sender<WorkerMsg>,
    max_depth: usize,
}

impl LaneShared {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, state: &mut LaneState, entity: &EntityId) -> Vec<Ready> {
        let Some(lanes) = state.entities.get_mut(entity) else {
            return Vec::new();
        };
        let ready: Vec<Ready> = lanes
            .take_runnable()
            .into_iter()
            .map(|job| Ready {
                entity: job.entity,
                key: job.key,
                run: job.run,
            })
            .collect();
        state.queued -= ready.len();
        metrics::set_lane_queue_depth(state.queued);
        ready
    }

    fn send_ready(&self, ready: Vec<Ready>) {
        for job in ready {
            if self.ready_tx.send(WorkerMsg::Run(job)).is_err() {
                tracing::error!("lane worker pool is gone; dropping job");
            }
        }
    }

    fn finish(&self, entity: &EntityId, key: ConcurrencyKey) {
        let ready = {
            let mut state = self.lock();
            if let Some(lanes) = state.entities.get_mut(entity) {
                lanes.running.remove(&key);
            }
            let ready = self.dispatch(&mut state, entity);
            if state.entities.get(entity).is_some_and(EntityLanes::is_idle) {
                state.entities.remove(entity);
            }
            ready
        };
        self.send_ready(ready);
    }
}

/// Handle for submitting work; cloneable into running jobs.
#[derive(Clone)]
pub struct LaneScheduler {
    shared: Arc<LaneShared>,
}

impl LaneScheduler {
    /// Queues a job. Fails with `Overloaded` when the upstream queue is full;
    /// the job's cancel callback is not invoked in that case.
    pub fn submit(&self, job: LaneJob) -> Result<(), EntityError> {
        let ready = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(EntityError::Refused {
                    reason: "lanes are shut down".to_string(),
                });
            }
            if state.queued >= self.shared.max_depth {
                metrics::lane_overloaded();
                return Err(EntityError::Overloaded {
                    subsystem: "lanes",
                    capacity: self.shared.max_depth,
                });
            }
            let entity = job.entity.clone();
            state
                .entities
                .entry(entity.clone())
                .or_default()
                .pending
                .push_back(job);
            state.queued += 1;
            self.shared.dispatch(&mut state, &entity)
        };
        self.shared.send_ready(ready);
        Ok(())
    }

    /// Cancels queued, non-sync jobs of `entity` up to the next create.
    /// Running jobs are unaffected. Returns the number cancelled.
    pub fn cancel_pending(&self, entity: &EntityId) -> usize {
        let (cancelled, ready) = {
            let mut state = self.shared.lock();
            let Some(lanes) = state.entities.get_mut(entity) else {
                return 0;
            };
            let mut cancelled = Vec::new();
            let mut kept = VecDeque::with_capacity(lanes.pending.len());
            let mut reached_create = false;
            for job in lanes.pending.drain(..) {
                if job.class == JobClass::Create {
                    reached_create = true;
                }
                if reached_create || job.class == JobClass::Sync {
                    kept.push_back(job);
                } else {
                    cancelled.push(job);
                }
            }
            lanes.pending = kept;
            state.queued -= cancelled.len();
            (cancelled, self.shared.dispatch(&mut state, entity))
        };
        self.shared.send_ready(ready);
        let count = cancelled.len();
        if count > 0 {
            tracing::debug!(entity = %entity, count, "cancelled pending jobs of destroyed entity");
            metrics::lane_cancelled(count);
        }
        for job in cancelled {
            (job.cancel)(EntityError::Destroyed {
                entity: entity.clone(),
            });
        }
        count
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queued
    }
}

pub struct LanePool {
    scheduler: LaneScheduler,
    workers: Vec<JoinHandle<()>>,
}

impl LanePool {
    pub fn start(workers: usize, max_depth: usize) -> std::io::Result<Self> {
        let (ready_tx, ready_rx) = crossbeam::channel::unbounded();
        let shared = Arc::new(LaneShared {
            state: Mutex::new(LaneState::default()),
            ready_tx,
            max_depth,
        });
        let mut joins = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let rx = ready_rx.clone();
            let join = thread::Builder::new()
                .name(format!("lane-worker-{index}"))
                .spawn(move || run_worker(shared, rx))?;
            joins.push(join);
        }
        Ok(Self {
            scheduler: LaneScheduler { shared },
            workers: joins,
        })
    }

    pub fn scheduler(&self) -> LaneScheduler {
        self.scheduler.clone()
    }

    /// Stops accepting work, cancels what is queued and joins the workers
    /// once running jobs finish.
    pub fn shutdown(self) {
        let cancelled: Vec<LaneJob> = {
            let mut state = self.scheduler.shared.lock();
            state.closed = true;
            state.queued = 0;
            state
                .entities
                .values_mut()
                .flat_map(|lanes| lanes.pending.drain(..))
                .collect()
        };
        for job in cancelled {
            (job.cancel)(EntityError::Refused {
                reason: "lanes are shut down".to_string(),
            });
        }
        for _ in &self.workers {
            let _ = self.scheduler.shared.ready_tx.send(WorkerMsg::Stop);
        }
        for join in self.workers {
            let _ = join.join();
        }
    }
}

fn run_worker(shared: Arc<LaneShared>, rx: Receiver<WorkerMsg>) {
    while let Ok(WorkerMsg::Run(ready)) = rx.recv() {
        (ready.run)();
        shared.finish(&ready.entity, ready.key);
    }
}
