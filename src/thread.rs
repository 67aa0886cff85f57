// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Thread groups and connection worker pools.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use slab::Slab;

////////////////////////////////////////////////////////////////////////
// THREAD GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A group of threads that is started and shut down as a unit.
///
/// Threads are added with [`ThreadGroup::start_oneshot`], which runs a
/// task once, or [`ThreadGroup::start_respawnable`], which restarts its
/// task whenever it exits or panics until the group shuts down. Child
/// [`WorkerPool`]s can be created with [`ThreadGroup::start_pool`].
///
/// [`ThreadGroup::shut_down`] flags the group (and its pools) as
/// shutting down; no thread can be started after that. It is up to the
/// tasks to notice, through [`ThreadGroup::is_shutting_down`], and
/// return. [`ThreadGroup::await_shutdown`] and
/// [`ThreadGroup::await_shutdown_timeout`] wait for the last thread to
/// exit.
pub struct ThreadGroup {
    records: Mutex<GroupRecords>,

    /// Notified when shutdown starts and when the last thread exits
    /// after that. Used with the `records` mutex.
    shutdown_wakeup: Condvar,
}

#[derive(Default)]
struct GroupRecords {
    thread_count: usize,
    pools: Slab<Arc<WorkerPool>>,
    shutting_down: bool,
}

impl GroupRecords {
    fn is_shut_down(&self) -> bool {
        self.shutting_down && self.thread_count == 0
    }
}

impl ThreadGroup {
    /// Creates a new thread group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            shutdown_wakeup: Condvar::new(),
        })
    }

    /// Starts a thread that runs `task` once.
    pub fn start_oneshot<F>(self: &Arc<Self>, name: String, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }
        spawn_oneshot(self, &mut records, name, task).map_err(Into::into)
    }

    /// Starts a thread that runs `task`, and runs it again on a fresh
    /// thread whenever it exits or panics before the group shuts down.
    /// Restarts are throttled to one per [`RESPAWN_DELAY`].
    pub fn start_respawnable<F>(self: &Arc<Self>, name: String, task: F) -> Result<(), Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }
        let task = Arc::new(move || {
            task();
            true
        });
        spawn_respawnable(self, &mut records, name, task).map_err(Into::into)
    }

    /// Begins shutting down the group and all of its pools.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        for pool in records.pools.drain() {
            pool.mark_shutting_down();
        }
        self.shutdown_wakeup.notify_all();
    }

    /// Blocks until the group has been shut down and every thread has
    /// exited. Calling this from inside the group deadlocks.
    pub fn await_shutdown(&self) {
        let records = self.records.lock().unwrap();
        let _records = self
            .shutdown_wakeup
            .wait_while(records, |r| !r.is_shut_down())
            .unwrap();
    }

    /// Like [`ThreadGroup::await_shutdown`], but gives up after
    /// `timeout`. Returns whether every thread exited in time.
    pub fn await_shutdown_timeout(&self, timeout: Duration) -> bool {
        let records = self.records.lock().unwrap();
        let (records, _) = self
            .shutdown_wakeup
            .wait_timeout_while(records, timeout, |r| !r.is_shut_down())
            .unwrap();
        records.is_shut_down()
    }

    /// Returns whether the group is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    /// Returns the number of live threads in the group.
    pub fn thread_count(&self) -> usize {
        self.records.lock().unwrap().thread_count
    }
}

/// Owned by every thread of a group; its drop does the bookkeeping for
/// a thread that exits or panics.
struct ThreadHandle {
    group: Arc<ThreadGroup>,
    spawner: ThreadId,
}

impl ThreadHandle {
    fn new(group: &Arc<ThreadGroup>) -> Self {
        Self {
            group: group.clone(),
            spawner: thread::current().id(),
        }
    }

    /// Returns whether we are being dropped by the spawning thread,
    /// which happens only when the OS refused to start the new thread.
    /// The spawner holds the records lock and cleans up itself.
    fn dropped_by_spawner(&self) -> bool {
        thread::current().id() == self.spawner
    }
}

fn spawn_oneshot<F>(
    group: &Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: String,
    task: F,
) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let handle = ThreadHandle::new(group);
    records.thread_count += 1;
    let result = thread::Builder::new().name(name).spawn(move || {
        task();
        drop(handle);
    });
    if result.is_err() {
        records.thread_count -= 1;
    }
    result.map(drop)
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.dropped_by_spawner() {
            return;
        }
        if thread::panicking() {
            error!("Thread {} panicked", current_thread_name());
        }
        let mut records = self.group.records.lock().unwrap();
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

/// The minimum time between successive starts of a respawnable thread.
pub const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// A respawnable task. It returns whether it wants to be restarted;
/// a panic always counts as wanting a restart.
type RespawnableTask = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// Owned by a respawnable thread. On drop it starts the replacement
/// thread (when wanted and the group is not shutting down) and does the
/// usual bookkeeping.
struct RespawnHandle {
    group: Arc<ThreadGroup>,
    spawner: ThreadId,
    task: RespawnableTask,
    started: Instant,
    respawn: bool,
}

fn spawn_respawnable(
    group: &Arc<ThreadGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: String,
    task: RespawnableTask,
) -> io::Result<()> {
    let mut handle = RespawnHandle {
        group: group.clone(),
        spawner: thread::current().id(),
        task,
        started: Instant::now(),
        respawn: true,
    };
    records.thread_count += 1;
    let result = thread::Builder::new().name(name).spawn(move || {
        handle.respawn = (handle.task)();
        drop(handle);
    });
    if result.is_err() {
        records.thread_count -= 1;
    }
    result.map(drop)
}

impl Drop for RespawnHandle {
    fn drop(&mut self) {
        // See ThreadHandle::dropped_by_spawner.
        if thread::current().id() == self.spawner {
            return;
        }
        let name = current_thread_name();
        if thread::panicking() {
            error!("Thread {} panicked", name);
        }

        let mut records = self.group.records.lock().unwrap();
        if self.respawn && !records.shutting_down {
            if !thread::panicking() {
                error!("Thread {} exited prematurely", name);
            }

            // Throttle the restart. Shutdown notifications cut the
            // wait short.
            let elapsed = self.started.elapsed();
            if elapsed < RESPAWN_DELAY {
                let delay = RESPAWN_DELAY - elapsed;
                info!(
                    "Restart of thread {} delayed by {} ms",
                    name,
                    delay.as_millis()
                );
                records = self
                    .group
                    .shutdown_wakeup
                    .wait_timeout(records, delay)
                    .unwrap()
                    .0;
            }

            if !records.shutting_down {
                let task = self.task.clone();
                if let Err(e) = spawn_respawnable(&self.group, &mut records, name.clone(), task) {
                    error!("Restart of thread {} failed: {}", name, e);
                }
            }
        }
        end_thread(&mut records, &self.group.shutdown_wakeup);
    }
}

fn end_thread(records: &mut MutexGuard<GroupRecords>, shutdown_wakeup: &Condvar) {
    records.thread_count -= 1;
    if records.is_shut_down() {
        shutdown_wakeup.notify_all();
    }
}

fn current_thread_name() -> String {
    thread::current().name().unwrap_or("anonymous").to_owned()
}

////////////////////////////////////////////////////////////////////////
// WORKER POOLS                                                       //
////////////////////////////////////////////////////////////////////////

/// A pool of worker threads for serving connections.
///
/// A fixed number of base workers wait for tasks. When all of them are
/// busy, [`WorkerPool::execute`] starts an auxiliary thread for the
/// task instead of queueing it, up to a limit; past that limit the task
/// is refused with [`Error::Saturated`] so that the caller can shed the
/// load.
///
/// A pool belongs to a [`ThreadGroup`] and shuts down with it.
pub struct WorkerPool {
    group: Arc<ThreadGroup>,
    key: usize,
    name: String,
    max_auxiliary: usize,
    records: Mutex<PoolRecords>,

    /// Notified when a task is queued or shutdown starts. Used with the
    /// `records` mutex.
    task_wakeup: Condvar,
}

/// Sizing of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// The number of long-lived workers.
    pub base_workers: usize,

    /// The most auxiliary threads that may run at once.
    pub max_auxiliary: usize,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolRecords {
    queue: VecDeque<Task>,
    idle_workers: usize,
    auxiliary: usize,
    next_auxiliary_id: u64,
    shutting_down: bool,
}

impl ThreadGroup {
    /// Starts a new [`WorkerPool`] in this group.
    pub fn start_pool(self: &Arc<Self>, name: &str, config: PoolConfig) -> Result<Arc<WorkerPool>, Error> {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let entry = records.pools.vacant_entry();
        let pool = Arc::new(WorkerPool {
            group: self.clone(),
            key: entry.key(),
            name: name.to_owned(),
            max_auxiliary: config.max_auxiliary,
            records: Mutex::new(PoolRecords {
                queue: VecDeque::with_capacity(config.base_workers),
                idle_workers: 0,
                auxiliary: 0,
                next_auxiliary_id: 0,
                shutting_down: false,
            }),
            task_wakeup: Condvar::new(),
        });
        entry.insert(pool.clone());

        for i in 0..config.base_workers {
            let worker_pool = pool.clone();
            let task: RespawnableTask = Arc::new(move || worker_loop(&worker_pool));
            let name = format!("{} worker {}", pool.name, i);
            if let Err(e) = spawn_respawnable(self, &mut records, name, task) {
                pool.mark_shutting_down();
                records.pools.remove(pool.key);
                return Err(e.into());
            }
        }
        Ok(pool)
    }
}

impl WorkerPool {
    /// Runs `task` on an idle base worker, or failing that on a new
    /// auxiliary thread.
    pub fn execute<F>(self: &Arc<Self>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if records.idle_workers > records.queue.len() {
            records.queue.push_back(Box::new(task));
            self.task_wakeup.notify_one();
            return Ok(());
        }
        if records.auxiliary >= self.max_auxiliary {
            return Err(Error::Saturated);
        }

        records.auxiliary += 1;
        let id = records.next_auxiliary_id;
        records.next_auxiliary_id += 1;
        drop(records);

        let pool = self.clone();
        let name = format!("{} auxiliary {}", self.name, id);
        let result = self.group.start_oneshot(name, move || {
            let _slot = AuxiliarySlot(&pool);
            task();
        });
        if result.is_err() {
            self.records.lock().unwrap().auxiliary -= 1;
        }
        result
    }

    /// Shuts down the pool without touching the rest of its group.
    pub fn shut_down(&self) {
        let mut group_records = self.group.records.lock().unwrap();
        // The slot may already be drained, or reused by a newer pool.
        let registered = group_records
            .pools
            .get(self.key)
            .map_or(false, |pool| std::ptr::eq(&**pool, self));
        if registered {
            group_records.pools.remove(self.key);
        }
        drop(group_records);
        self.mark_shutting_down();
    }

    /// Returns whether the pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    fn mark_shutting_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        self.task_wakeup.notify_all();
    }
}

/// Releases an auxiliary thread's slot when its task finishes, even by
/// panicking.
struct AuxiliarySlot<'a>(&'a WorkerPool);

impl Drop for AuxiliarySlot<'_> {
    fn drop(&mut self) {
        let mut records = self.0.records.lock().unwrap();
        records.auxiliary -= 1;
        if records.auxiliary + 1 == self.0.max_auxiliary {
            info!("Pool {} is accepting auxiliary tasks again", self.0.name);
        }
    }
}

/// Runs queued tasks until the pool shuts down. Returns `false` so that
/// the worker is not restarted after a shutdown of the pool alone.
fn worker_loop(pool: &WorkerPool) -> bool {
    loop {
        let mut records = pool.records.lock().unwrap();
        records.idle_workers += 1;
        let task = loop {
            if let Some(task) = records.queue.pop_front() {
                break task;
            } else if records.shutting_down {
                return false;
            }
            records = pool.task_wakeup.wait(records).unwrap();
        };
        records.idle_workers -= 1;
        drop(records);
        task();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error from [`ThreadGroup`] and [`WorkerPool`] operations.
#[derive(Debug)]
pub enum Error {
    /// The OS failed to start a thread.
    Io(io::Error),

    /// The group or pool is shutting down.
    ShuttingDown,

    /// Every worker is busy and the auxiliary thread limit is reached.
    Saturated,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to start thread: {}", err),
            Self::ShuttingDown => f.write_str("thread group or pool is shutting down"),
            Self::Saturated => f.write_str("worker pool is saturated"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Logs a warning when a pool refuses a task for lack of capacity.
pub(crate) fn warn_saturated(pool: &WorkerPool) {
    warn!(
        "Pool {} is saturated ({} auxiliary threads busy)",
        pool.name, pool.max_auxiliary
    );
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
