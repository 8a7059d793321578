//! Process-memory pressure feedback loop.
//!
//! Samples resident memory on a fixed interval, classifies it against the
//! configured thresholds, and fans the result out to registered listeners.
//! The hard-limit path can additionally fire a reclaim hook (the closest
//! thing to a forced collection this runtime has), gated by a cooldown so a
//! process pinned above the limit does not thrash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{env_millis, env_parse, env_secs};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Memory baseline the soft/hard ratios apply to, bytes.
    pub baseline_bytes: u64,
    pub soft_ratio: f64,
    pub hard_ratio: f64,
    pub sample_interval: Duration,
    /// Minimum spacing between reclaim-hook invocations.
    pub reclaim_cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            baseline_bytes: 2 * 1024 * 1024 * 1024,
            soft_ratio: 0.80,
            hard_ratio: 0.90,
            sample_interval: Duration::from_secs(10),
            reclaim_cooldown: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            baseline_bytes: env_parse("RIPTIDE_MEMORY_BASELINE_MB", defaults.baseline_bytes / (1024 * 1024))
                * 1024
                * 1024,
            soft_ratio: env_parse("RIPTIDE_MEMORY_SOFT_RATIO", defaults.soft_ratio),
            hard_ratio: env_parse("RIPTIDE_MEMORY_HARD_RATIO", defaults.hard_ratio),
            sample_interval: env_secs("RIPTIDE_MEMORY_SAMPLE_SECS", defaults.sample_interval),
            reclaim_cooldown: env_millis("RIPTIDE_MEMORY_COOLDOWN_MS", defaults.reclaim_cooldown),
        }
    }
}

/// Coarse classification of current usage against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    None,
    /// At or above the soft threshold.
    Low,
    /// Within 5% of the hard limit.
    High,
    /// At or above the hard limit.
    Critical,
}

/// Receives pressure callbacks. Soft fires for [`PressureLevel::Low`] and
/// [`PressureLevel::High`], hard for [`PressureLevel::Critical`].
pub trait PressureListener: Send + Sync {
    fn on_soft_limit(&self, usage_bytes: u64, level: PressureLevel);
    fn on_hard_limit(&self, usage_bytes: u64, level: PressureLevel);
}

pub type MemorySampler = Box<dyn Fn() -> u64 + Send + Sync>;
pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

pub struct MemoryMonitor {
    soft_limit: u64,
    hard_limit: u64,
    /// 95% of the hard limit; the High band sits between this and hard.
    critical_mark: u64,
    sample_interval: Duration,
    reclaim_cooldown: Duration,
    sampler: MemorySampler,
    listeners: RwLock<Vec<Arc<dyn PressureListener>>>,
    reclaim: RwLock<Option<ReclaimHook>>,
    paused: AtomicBool,
    last_reclaim: Mutex<Option<Instant>>,
    last_level: Mutex<PressureLevel>,
}

impl MemoryMonitor {
    /// Monitor backed by the process's real resident set size.
    pub fn new(config: MonitorConfig) -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = Mutex::new(System::new());
        let sampler: MemorySampler = Box::new(move || {
            let mut system = system.lock();
            system.refresh_process(pid);
            system.process(pid).map(|process| process.memory()).unwrap_or(0)
        });
        Self::with_sampler(config, sampler)
    }

    /// Monitor with an injected usage source. Tests drive this directly.
    pub fn with_sampler(config: MonitorConfig, sampler: MemorySampler) -> Self {
        let soft_limit = (config.baseline_bytes as f64 * config.soft_ratio) as u64;
        let hard_limit = (config.baseline_bytes as f64 * config.hard_ratio) as u64;
        let critical_mark = (hard_limit as f64 * 0.95) as u64;
        Self {
            soft_limit,
            hard_limit,
            critical_mark,
            sample_interval: config.sample_interval,
            reclaim_cooldown: config.reclaim_cooldown,
            sampler,
            listeners: RwLock::new(Vec::new()),
            reclaim: RwLock::new(None),
            paused: AtomicBool::new(false),
            last_reclaim: Mutex::new(None),
            last_level: Mutex::new(PressureLevel::None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PressureListener>) {
        self.listeners.write().push(listener);
    }

    /// Installs the reclaim hook run on hard-limit samples, replacing any
    /// previous hook.
    pub fn set_reclaim_hook(&self, hook: ReclaimHook) {
        *self.reclaim.write() = Some(hook);
    }

    /// Suspends periodic sampling; `check_now` still works while paused.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn hard_limit(&self) -> u64 {
        self.hard_limit
    }

    /// Samples immediately, dispatches callbacks, and returns the level.
    pub fn check_now(&self) -> PressureLevel {
        let usage = (self.sampler)();
        self.evaluate(usage)
    }

    pub fn classify(&self, usage: u64) -> PressureLevel {
        if usage >= self.hard_limit {
            PressureLevel::Critical
        } else if usage >= self.critical_mark {
            PressureLevel::High
        } else if usage >= self.soft_limit {
            PressureLevel::Low
        } else {
            PressureLevel::None
        }
    }

    fn evaluate(&self, usage: u64) -> PressureLevel {
        let level = self.classify(usage);
        {
            let mut last = self.last_level.lock();
            if *last != level {
                info!(
                    target: "riptide::memory",
                    usage_bytes = usage,
                    level = ?level,
                    "memory pressure level changed"
                );
                *last = level;
            }
        }
        // Listener snapshot; user callbacks never run under our lock.
        let listeners: Vec<Arc<dyn PressureListener>> = self.listeners.read().clone();
        match level {
            PressureLevel::Critical => {
                warn!(
                    target: "riptide::memory",
                    usage_bytes = usage,
                    hard_limit = self.hard_limit,
                    "hard memory limit exceeded"
                );
                for listener in &listeners {
                    listener.on_hard_limit(usage, level);
                }
                self.maybe_reclaim(usage);
            }
            PressureLevel::Low | PressureLevel::High => {
                for listener in &listeners {
                    listener.on_soft_limit(usage, level);
                }
            }
            PressureLevel::None => {}
        }
        level
    }

    fn maybe_reclaim(&self, usage: u64) {
        {
            let mut last = self.last_reclaim.lock();
            match *last {
                Some(at) if at.elapsed() < self.reclaim_cooldown => return,
                _ => *last = Some(Instant::now()),
            }
        }
        if let Some(hook) = self.reclaim.read().as_ref() {
            info!(target: "riptide::memory", usage_bytes = usage, "running reclaim hook");
            hook();
        }
    }

    /// Starts the periodic sampler. The returned handle is aborted by the
    /// host on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.is_paused() {
                    continue;
                }
                self.check_now();
            }
        })
    }
}
