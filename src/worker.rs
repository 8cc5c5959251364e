//! Worker threads
//!
//! One worker per active logical processor. Each worker hosts a
//! current-thread tokio runtime so every connection and stream callback for
//! a given connection runs on the thread that owns it; workers share nothing
//! mutable with each other beyond the client's latency cursor.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::buffer::ObjectPool;
use crate::client::ClientShared;
use crate::config::PerfConfig;
use crate::error::{PerfError, Result};
use crate::tcp::TcpSendData;

/// How long in-flight connections get to observe transport close events
/// after the run stops.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

/// Descriptors pre-allocated per worker for the TCP send path.
const SEND_POOL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct WorkerCounters {
    pub connections_queued: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_connected: AtomicU64,
    pub connections_completed: AtomicU64,
    pub streams_started: AtomicU64,
    pub streams_completed: AtomicU64,
}

pub struct Worker {
    pub processor: usize,
    /// Hostname this worker connects to, optionally suffixed per processor.
    pub target: String,
    pub remote_addr: SocketAddr,
    /// Local bind address. Filled in after the first connect when binding
    /// sharing is requested without an explicit address.
    pub local_addr: Mutex<Option<SocketAddr>>,
    pub counters: WorkerCounters,
    wake: Notify,
}

impl Worker {
    pub fn new(
        processor: usize,
        target: String,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            processor,
            target,
            remote_addr,
            local_addr: Mutex::new(local_addr),
            counters: WorkerCounters::default(),
            wake: Notify::new(),
        }
    }

    /// Hand this worker one more connection to establish.
    pub fn queue_new_connection(&self) {
        self.counters
            .connections_queued
            .fetch_add(1, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn parked(&self) {
        self.wake.notified().await;
    }

    /// A connection finished for any reason. Requeues in repeat mode,
    /// otherwise checks the completion predicate.
    pub fn on_connection_complete(&self, shared: &ClientShared, config: &PerfConfig) {
        self.counters
            .connections_completed
            .fetch_add(1, Ordering::Release);
        self.counters
            .connections_active
            .fetch_sub(1, Ordering::Release);
        shared.note_connection_completed();
        if config.repeat_connections {
            if shared.running() {
                self.queue_new_connection();
            }
        } else if self.counters.connections_active.load(Ordering::Acquire) == 0
            && self.counters.connections_created.load(Ordering::Acquire)
                == self.counters.connections_queued.load(Ordering::Acquire)
        {
            shared.on_worker_connections_complete();
        }
    }
}

/// Per-worker context shared by the connection tasks on the worker's thread.
pub struct WorkerCtx {
    pub worker: Arc<Worker>,
    pub shared: Arc<ClientShared>,
    pub config: Arc<PerfConfig>,
    /// Shared QUIC endpoint when binding sharing is on.
    pub endpoint: RefCell<Option<quinn::Endpoint>>,
    /// Free-list for TCP send descriptors.
    pub send_pool: ObjectPool<TcpSendData>,
}

/// Spawn the worker thread. The thread owns its runtime and exits once
/// `running` clears and in-flight work has drained.
pub fn spawn(
    worker: Arc<Worker>,
    shared: Arc<ClientShared>,
    config: Arc<PerfConfig>,
) -> Result<JoinHandle<()>> {
    let affinitize = config.affinitize_workers;
    let processor = worker.processor;
    thread::Builder::new()
        .name(format!("perf-worker-{processor}"))
        .spawn(move || {
            if affinitize {
                pin_to_processor(processor);
            }
            run_worker(worker, shared, config);
        })
        .map_err(|err| PerfError::ThreadStart(err.to_string()))
}

fn run_worker(worker: Arc<Worker>, shared: Arc<ClientShared>, config: Arc<PerfConfig>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(processor = worker.processor, error = %err, "failed to build worker runtime");
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    let ctx = Rc::new(WorkerCtx {
        worker,
        shared,
        config,
        endpoint: RefCell::new(None),
        send_pool: ObjectPool::new(SEND_POOL_CAPACITY),
    });

    local.block_on(&runtime, worker_loop(ctx.clone()));

    // Closing the shared endpoint lets in-flight connections observe their
    // shutdown events before the runtime is torn down.
    local.block_on(&runtime, async {
        if let Some(endpoint) = ctx.endpoint.borrow_mut().take() {
            endpoint.close(0u32.into(), b"done");
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, std::future::pending::<()>()).await;
    });
    debug!(processor = ctx.worker.processor, "worker stopped");
}

async fn worker_loop(ctx: Rc<WorkerCtx>) {
    while ctx.shared.running() {
        let counters = &ctx.worker.counters;
        while ctx.shared.running()
            && counters.connections_created.load(Ordering::Acquire)
                < counters.connections_queued.load(Ordering::Acquire)
        {
            start_new_connection(&ctx);
        }
        if !ctx.shared.running() {
            break;
        }
        ctx.worker.parked().await;
    }
}

fn start_new_connection(ctx: &Rc<WorkerCtx>) {
    let counters = &ctx.worker.counters;
    counters.connections_created.fetch_add(1, Ordering::Release);
    counters.connections_active.fetch_add(1, Ordering::Release);
    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        if ctx.config.use_tcp {
            crate::tcp::run_connection(ctx).await;
        } else {
            crate::quic::run_connection(ctx).await;
        }
    });
}

/// Logical processors this process may run on.
#[cfg(target_os = "linux")]
pub fn active_processors() -> Vec<usize> {
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;

    if let Ok(set) = sched_getaffinity(Pid::from_raw(0)) {
        let active: Vec<usize> = (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect();
        if !active.is_empty() {
            return active;
        }
    }
    (0..num_cpus::get()).collect()
}

#[cfg(not(target_os = "linux"))]
pub fn active_processors() -> Vec<usize> {
    (0..num_cpus::get()).collect()
}

#[cfg(target_os = "linux")]
fn pin_to_processor(processor: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    if set.set(processor).is_ok() {
        if let Err(err) = sched_setaffinity(Pid::from_raw(0), &set) {
            tracing::warn!(processor, error = %err, "failed to pin worker");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_processor(_processor: usize) {}
