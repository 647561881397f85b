//! Periodic task runner.
//!
//! ESP-IDF implements `std::thread` on pthreads, which are thin wrappers
//! around FreeRTOS tasks. `esp_pthread_set_cfg()` sets thread-local
//! configuration for the *next* `pthread_create()` from the calling
//! thread, so the config→spawn pair in [`spawn_on_core`] must not be
//! interleaved with other thread creation on the same thread.
//!
//! A [`PeriodicTask`] runs its body once per period until stopped. The
//! loop sleeps on a condvar, so `stop()` wakes it immediately instead of
//! waiting out the period.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};

/// CPU core identifiers for the ESP32-S3 Xtensa LX7 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): protocol stacks.
    Pro = 0,
    /// Core 1 (APP_CPU): control loops.
    App = 1,
}

/// Placement of a task thread.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    /// Null-terminated, e.g. `"fan_ctrl\0"`.
    pub name: &'static str,
    pub core: Core,
    pub priority: u8,
    pub stack_kb: usize,
}

impl TaskSpec {
    pub fn display_name(&self) -> &'static str {
        self.name.trim_end_matches('\0')
    }
}

/// Spawn a thread pinned to a core with explicit priority and stack.
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    // SAFETY: the config struct is fully initialised by the IDF helper and
    // `name` is 'static and null-terminated.
    let ret = unsafe {
        let mut cfg = esp_idf_sys::esp_create_default_pthread_config();
        cfg.pin_to_core = spec.core as i32;
        cfg.prio = spec.priority as i32;
        cfg.stack_size = (spec.stack_kb * 1024) as i32;
        cfg.thread_name = spec.name.as_ptr() as *const _;
        esp_idf_sys::esp_pthread_set_cfg(&cfg)
    };
    if ret != esp_idf_sys::ESP_OK as i32 {
        warn!("task: esp_pthread_set_cfg failed for '{}': {}", spec.display_name(), ret);
        return Err(Error::Internal("pthread config failed"));
    }

    info!(
        "task: spawning '{}' on {:?} (pri={}, stack={}KB)",
        spec.display_name(),
        spec.core,
        spec.priority,
        spec.stack_kb
    );
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .spawn(f)
        .map_err(|_| Error::Internal("task spawn failed"))
}

/// Simulation fallback: ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(spec: TaskSpec, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    info!(
        "task: spawning '{}' (sim, no core pinning, stack={}KB)",
        spec.display_name(),
        spec.stack_kb
    );
    std::thread::Builder::new()
        .name(spec.display_name().into())
        .stack_size(spec.stack_kb * 1024)
        .spawn(f)
        .map_err(|_| Error::Internal("task spawn failed"))
}

// ── PeriodicTask ──────────────────────────────────────────────

#[derive(Default)]
struct Flags {
    stop: bool,
    exited: bool,
}

#[derive(Default)]
struct Signal {
    flags: Mutex<Flags>,
    cv: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PeriodicTask {
    name: &'static str,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start a thread that calls `body` every `period_ms`. The first call
    /// happens immediately.
    pub fn spawn(
        spec: TaskSpec,
        period_ms: u32,
        mut body: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        if period_ms == 0 {
            return Err(Error::InvalidArg("period must be non-zero"));
        }
        let signal = Arc::new(Signal::default());
        let sig = Arc::clone(&signal);
        let period = Duration::from_millis(u64::from(period_ms));
        let handle = spawn_on_core(spec, move || {
            loop {
                if sig.lock().stop {
                    break;
                }
                body();
                let guard = sig.lock();
                let (guard, _) = sig
                    .cv
                    .wait_timeout_while(guard, period, |f| !f.stop)
                    .unwrap_or_else(PoisonError::into_inner);
                if guard.stop {
                    break;
                }
            }
            sig.lock().exited = true;
            sig.cv.notify_all();
        })?;
        Ok(Self {
            name: spec.display_name(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.signal.lock().exited
    }

    /// Ask the loop to exit and wait up to `wait_ms` for it. On timeout
    /// the thread is detached and `Error::Timeout` returned.
    pub fn stop(&mut self, wait_ms: u32) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let guard = {
            let mut flags = self.signal.lock();
            flags.stop = true;
            self.signal.cv.notify_all();
            let wait = Duration::from_millis(u64::from(wait_ms));
            self.signal
                .cv
                .wait_timeout_while(flags, wait, |f| !f.exited)
                .unwrap_or_else(PoisonError::into_inner)
                .0
        };
        if !guard.exited {
            drop(guard);
            warn!("task: '{}' did not stop within {}ms", self.name, wait_ms);
            return Err(Error::Timeout);
        }
        drop(guard);
        if handle.join().is_err() {
            warn!("task: '{}' panicked", self.name);
        }
        info!("task: '{}' stopped", self.name);
        Ok(())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let mut flags = self.signal.lock();
            flags.stop = true;
            self.signal.cv.notify_all();
        }
    }
}
