//! Pool of reusable daemon processes.
//!
//! Daemons are grouped by their exact `ProcessOptions` and are never handed
//! to work with a different config. Each daemon moves through
//! `Starting -> Idle -> Busy -> Idle -> ...` until the reaper or a shutdown
//! terminates it.
//!
//! All bookkeeping lives behind one mutex. Spawning and terminating
//! processes happens outside it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::config::{DaemonPoolConfig, ProcessOptions};
use crate::error::{Error, Result};
use crate::pressure::{NoPressure, ResourcePressure};
use crate::work::{Outcome, WorkItem};

use super::daemon::{DaemonHandle, DaemonId};

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Infrastructure(format!("Daemon pool lock poisoned (thread panicked): {}", e))
}

/// Lifecycle state of a live daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Busy,
}

/// Snapshot of one live daemon.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub id: DaemonId,
    pub pid: u32,
    pub options: ProcessOptions,
    pub state: DaemonState,
    /// How long the daemon has been idle, for idle daemons.
    pub idle_for: Option<Duration>,
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub starting: usize,
    pub spawned_total: u64,
    pub evicted_total: u64,
}

struct IdleDaemon {
    handle: DaemonHandle,
    since: Instant,
}

#[derive(Default)]
struct DaemonGroup {
    /// Most recently released at the back.
    idle: VecDeque<IdleDaemon>,
    busy: Vec<(DaemonId, u32)>,
    starting: usize,
}

impl DaemonGroup {
    fn live(&self) -> usize {
        self.idle.len() + self.busy.len() + self.starting
    }

    fn remove_busy(&mut self, id: DaemonId) {
        if let Some(pos) = self.busy.iter().position(|(busy_id, _)| *busy_id == id) {
            self.busy.swap_remove(pos);
        }
    }
}

#[derive(Default)]
struct PoolState {
    groups: FxHashMap<ProcessOptions, DaemonGroup>,
    shutdown: bool,
    spawned_total: u64,
    evicted_total: u64,
}

impl PoolState {
    fn live_total(&self) -> usize {
        self.groups.values().map(DaemonGroup::live).sum()
    }

    fn group_mut(&mut self, options: &ProcessOptions) -> &mut DaemonGroup {
        if !self.groups.contains_key(options) {
            self.groups.insert(options.clone(), DaemonGroup::default());
        }
        self.groups
            .get_mut(options)
            .unwrap_or_else(|| unreachable!("group inserted above"))
    }

    /// Take the most recently released live daemon for `options`.
    ///
    /// Dead idle daemons found on the way are moved to `dead`.
    fn take_idle(
        &mut self,
        options: &ProcessOptions,
        dead: &mut Vec<DaemonHandle>,
    ) -> Option<DaemonHandle> {
        let group = self.groups.get_mut(options)?;
        while let Some(mut idle) = group.idle.pop_back() {
            if idle.handle.is_alive() {
                group.busy.push((idle.handle.id(), idle.handle.pid()));
                return Some(idle.handle);
            }
            dead.push(idle.handle);
        }
        None
    }

    /// Remove the daemon that has been idle longest, optionally skipping a config.
    fn take_oldest_idle(&mut self, skip: Option<&ProcessOptions>) -> Option<DaemonHandle> {
        let (options, _) = self
            .groups
            .iter()
            .filter(|(options, _)| Some(*options) != skip)
            .filter_map(|(options, group)| group.idle.front().map(|d| (options, d.since)))
            .min_by_key(|(_, since)| *since)?;
        let options = options.clone();
        let handle = self.groups.get_mut(&options)?.idle.pop_front()?.handle;
        self.evicted_total += 1;
        Some(handle)
    }

    /// Remove all daemons idle for longer than `timeout`.
    fn take_expired(&mut self, timeout: Duration) -> Vec<DaemonHandle> {
        let mut expired = Vec::new();
        for group in self.groups.values_mut() {
            // Oldest at the front, so stop at the first fresh one.
            while group
                .idle
                .front()
                .is_some_and(|d| d.since.elapsed() > timeout)
            {
                if let Some(idle) = group.idle.pop_front() {
                    expired.push(idle.handle);
                }
            }
        }
        self.evicted_total += expired.len() as u64;
        expired
    }

    fn prune_empty_groups(&mut self) {
        self.groups.retain(|_, group| group.live() > 0);
    }
}

struct PoolShared {
    config: DaemonPoolConfig,
    pressure: Box<dyn ResourcePressure>,
    state: Mutex<PoolState>,
    /// Signalled when capacity frees up.
    released: Condvar,
    /// Signalled to wake the reaper early.
    reaper_wake: Condvar,
}

impl PoolShared {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(lock_error)
    }

    fn release(&self, options: &ProcessOptions, mut handle: DaemonHandle) {
        let alive = handle.is_alive();
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => {
                handle.terminate();
                return;
            }
        };
        let shutdown = state.shutdown;
        state.group_mut(options).remove_busy(handle.id());

        if alive && !shutdown {
            state.group_mut(options).idle.push_back(IdleDaemon {
                handle,
                since: Instant::now(),
            });
            drop(state);
            self.released.notify_all();
            return;
        }

        drop(state);
        self.released.notify_all();
        if !alive {
            tracing::warn!(daemon = %handle.id(), pid = handle.pid(), "discarding dead daemon");
        }
        handle.terminate();
    }

    fn reap_expired(&self) -> Result<usize> {
        let expired = self.lock()?.take_expired(self.config.idle_timeout);
        let count = expired.len();
        for mut handle in expired {
            tracing::info!(daemon = %handle.id(), pid = handle.pid(), "evicting idle daemon");
            handle.terminate();
        }
        Ok(count)
    }

    fn reap_under_pressure(&self) -> Result<usize> {
        let mut count = 0;
        while self.pressure.is_under_pressure() {
            let victim = self.lock()?.take_oldest_idle(None);
            let Some(mut handle) = victim else {
                break;
            };
            tracing::info!(
                daemon = %handle.id(),
                pid = handle.pid(),
                "evicting idle daemon under resource pressure"
            );
            handle.terminate();
            count += 1;
        }
        Ok(count)
    }

    fn reap(&self) -> Result<usize> {
        let count = self.reap_expired()? + self.reap_under_pressure()?;
        if count > 0 {
            let mut state = self.lock()?;
            state.prune_empty_groups();
            drop(state);
            self.released.notify_all();
        }
        Ok(count)
    }
}

fn reaper_loop(shared: Arc<PoolShared>) {
    loop {
        {
            let Ok(state) = shared.lock() else {
                return;
            };
            if state.shutdown {
                return;
            }
            let Ok((state, _)) = shared
                .reaper_wake
                .wait_timeout(state, shared.config.reap_interval)
            else {
                return;
            };
            if state.shutdown {
                return;
            }
        }
        if let Err(e) = shared.reap() {
            tracing::warn!("daemon reaper stopped: {}", e);
            return;
        }
    }
}

/// Pool of daemon processes shared by work queues.
///
/// A pool may outlive the executors that use it, which is how daemons
/// persist across sessions.
pub struct DaemonPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonPool {
    /// Create a pool that never sees resource pressure.
    pub fn new(config: DaemonPoolConfig) -> Result<Arc<Self>> {
        Self::with_pressure(config, NoPressure)
    }

    /// Create a pool whose reaper polls `pressure`.
    pub fn with_pressure(
        config: DaemonPoolConfig,
        pressure: impl ResourcePressure + 'static,
    ) -> Result<Arc<Self>> {
        Self::with_boxed_pressure(config, Box::new(pressure))
    }

    pub(crate) fn with_boxed_pressure(
        config: DaemonPoolConfig,
        pressure: Box<dyn ResourcePressure>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let shared = Arc::new(PoolShared {
            config,
            pressure,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
            reaper_wake: Condvar::new(),
        });

        let reaper = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("workhive-reaper".to_string())
                .spawn(move || reaper_loop(shared))?
        };

        Ok(Arc::new(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        }))
    }

    pub fn config(&self) -> &DaemonPoolConfig {
        &self.shared.config
    }

    /// Get a daemon for `options`, starting one if none is idle.
    ///
    /// Blocks while the pool is at capacity for this config.
    pub fn acquire(&self, options: &ProcessOptions) -> Result<DaemonLease> {
        let shared = &self.shared;
        let mut dead = Vec::new();
        let mut victim = None;

        let mut state = shared.lock()?;
        loop {
            if state.shutdown {
                return Err(Error::ShutDown);
            }

            if let Some(handle) = state.take_idle(options, &mut dead) {
                drop(state);
                discard(dead);
                tracing::debug!(daemon = %handle.id(), pid = handle.pid(), "reusing idle daemon");
                return Ok(DaemonLease::new(handle, options.clone(), shared.clone()));
            }

            let group_live = state.groups.get(options).map_or(0, DaemonGroup::live);
            if group_live < shared.config.max_daemons_per_config {
                if state.live_total() < shared.config.max_daemons {
                    break;
                }
                // Make room by evicting another config's oldest idle daemon.
                if let Some(handle) = state.take_oldest_idle(Some(options)) {
                    victim = Some(handle);
                    break;
                }
            }

            state = shared.released.wait(state).map_err(lock_error)?;
        }

        state.group_mut(options).starting += 1;
        drop(state);

        discard(dead);
        if let Some(mut handle) = victim {
            tracing::info!(daemon = %handle.id(), pid = handle.pid(), "evicting idle daemon to make room");
            handle.terminate();
        }

        let spawned = DaemonHandle::spawn(options, shared.config.startup_timeout);

        let mut state = shared.lock()?;
        state.group_mut(options).starting -= 1;
        match spawned {
            Ok(mut handle) => {
                if state.shutdown {
                    drop(state);
                    handle.terminate();
                    return Err(Error::ShutDown);
                }
                state.spawned_total += 1;
                state
                    .group_mut(options)
                    .busy
                    .push((handle.id(), handle.pid()));
                Ok(DaemonLease::new(handle, options.clone(), shared.clone()))
            }
            Err(e) => {
                state.prune_empty_groups();
                drop(state);
                shared.released.notify_all();
                Err(e)
            }
        }
    }

    /// Run one reaper pass immediately. Returns the number of daemons evicted.
    pub fn reap_now(&self) -> Result<usize> {
        self.shared.reap()
    }

    pub fn stats(&self) -> PoolStats {
        let Ok(state) = self.shared.lock() else {
            return PoolStats::default();
        };
        let mut stats = PoolStats {
            spawned_total: state.spawned_total,
            evicted_total: state.evicted_total,
            ..PoolStats::default()
        };
        for group in state.groups.values() {
            stats.idle += group.idle.len();
            stats.busy += group.busy.len();
            stats.starting += group.starting;
        }
        stats
    }

    /// Snapshot of every live daemon.
    pub fn daemons(&self) -> Vec<DaemonInfo> {
        let Ok(state) = self.shared.lock() else {
            return Vec::new();
        };
        let mut infos = Vec::new();
        for (options, group) in &state.groups {
            for idle in &group.idle {
                infos.push(DaemonInfo {
                    id: idle.handle.id(),
                    pid: idle.handle.pid(),
                    options: options.clone(),
                    state: DaemonState::Idle,
                    idle_for: Some(idle.since.elapsed()),
                });
            }
            for &(id, pid) in &group.busy {
                infos.push(DaemonInfo {
                    id,
                    pid,
                    options: options.clone(),
                    state: DaemonState::Busy,
                    idle_for: None,
                });
            }
        }
        infos
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().map(|s| s.shutdown).unwrap_or(true)
    }

    /// Stop the reaper and terminate idle daemons.
    ///
    /// Busy daemons are terminated when their lease is dropped.
    pub fn shutdown(&self) {
        let idle: Vec<DaemonHandle> = match self.shared.lock() {
            Ok(mut state) => {
                state.shutdown = true;
                state
                    .groups
                    .values_mut()
                    .flat_map(|group| group.idle.drain(..).map(|d| d.handle))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        self.shared.released.notify_all();
        self.shared.reaper_wake.notify_all();

        if let Some(reaper) = self.reaper.lock().ok().and_then(|mut r| r.take()) {
            let _ = reaper.join();
        }

        if !idle.is_empty() {
            tracing::info!(count = idle.len(), "terminating idle daemons");
        }
        for mut handle in idle {
            handle.terminate();
        }
    }
}

impl Drop for DaemonPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn discard(dead: Vec<DaemonHandle>) {
    for mut handle in dead {
        tracing::warn!(daemon = %handle.id(), pid = handle.pid(), "discarding dead idle daemon");
        handle.terminate();
    }
}

/// Exclusive use of one daemon. Returns it to the pool on drop.
pub struct DaemonLease {
    handle: Option<DaemonHandle>,
    options: ProcessOptions,
    shared: Arc<PoolShared>,
}

impl DaemonLease {
    fn new(handle: DaemonHandle, options: ProcessOptions, shared: Arc<PoolShared>) -> Self {
        Self {
            handle: Some(handle),
            options,
            shared,
        }
    }

    pub fn id(&self) -> Option<DaemonId> {
        self.handle.as_ref().map(DaemonHandle::id)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(DaemonHandle::pid)
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    /// Run one item on the leased daemon.
    pub fn execute(&mut self, item: &WorkItem) -> Outcome {
        match self.handle.as_mut() {
            Some(handle) => handle.execute(item),
            None => Outcome::Failure(crate::work::Failure::infrastructure(
                "daemon lease already released",
            )),
        }
    }
}

impl Drop for DaemonLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.release(&self.options, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_rejects_zero_bounds() {
        let config = DaemonPoolConfig::default().with_max_daemons(0);
        assert!(matches!(
            DaemonPool::new(config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_spawn_failure_releases_capacity() {
        let config = DaemonPoolConfig::default()
            .with_max_daemons(1)
            .with_max_daemons_per_config(1);
        let pool = DaemonPool::new(config).unwrap();
        let options = ProcessOptions::new().with_program("/definitely/not/a/daemon");

        // Both attempts fail fast instead of the second waiting for capacity.
        for _ in 0..2 {
            let err = pool.acquire(&options).err().unwrap();
            assert!(matches!(err, Error::Infrastructure(_)));
        }
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_acquire_after_shutdown() {
        let pool = DaemonPool::new(DaemonPoolConfig::default()).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.acquire(&ProcessOptions::new()),
            Err(Error::ShutDown)
        ));
    }

    #[test]
    fn test_reap_now_on_empty_pool() {
        let pool = DaemonPool::with_pressure(DaemonPoolConfig::default(), || true).unwrap();
        assert_eq!(pool.reap_now().unwrap(), 0);
        assert!(pool.daemons().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_silent_daemon_does_not_block_acquire() {
        let Ok(program) = which::which("sleep") else {
            return;
        };
        let config = DaemonPoolConfig::default()
            .with_max_daemons_per_config(1)
            .with_startup_timeout(Duration::from_millis(200));
        let pool = DaemonPool::new(config).unwrap();
        let options = ProcessOptions::new().with_program(program).with_arg("60");

        // The second attempt proves the first gave its starting slot back.
        for _ in 0..2 {
            let started = Instant::now();
            let err = pool.acquire(&options).err().unwrap();
            assert!(matches!(err, Error::Infrastructure(_)));
            assert!(started.elapsed() < Duration::from_secs(10));
        }
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
