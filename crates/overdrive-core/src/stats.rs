//! Counters for the status surface.
//!
//! Every counter is an independent relaxed atomic: each value is exact, but a
//! snapshot taken while the host is allocating may mix slightly different
//! moments across fields.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug)]
pub struct StatsTracker {
    initialized_at: DateTime<Utc>,
    allocations: AtomicU64,
    fallback_allocations: AtomicU64,
    zeroed_allocations: AtomicU64,
    reallocations: AtomicU64,
    frees: AtomicU64,
    pool_frees: AtomicU64,
    foreign_frees: AtomicU64,
    bytes_allocated: AtomicU64,
    peak_used: AtomicUsize,
    hooks_installed: AtomicU64,
    hooks_failed: AtomicU64,
    hooks_restored: AtomicU64,
    patches_applied: AtomicU64,
    patches_failed: AtomicU64,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            initialized_at: Utc::now(),
            allocations: AtomicU64::new(0),
            fallback_allocations: AtomicU64::new(0),
            zeroed_allocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            pool_frees: AtomicU64::new(0),
            foreign_frees: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            peak_used: AtomicUsize::new(0),
            hooks_installed: AtomicU64::new(0),
            hooks_failed: AtomicU64::new(0),
            hooks_restored: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            patches_failed: AtomicU64::new(0),
        }
    }

    /// A pool-served allocation of `bytes` (block size including header).
    pub fn record_allocation(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zeroed(&self) {
        self.zeroed_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reallocation(&self) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, from_pool: bool) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        if from_pool {
            self.pool_frees.fetch_add(1, Ordering::Relaxed);
        } else {
            self.foreign_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn update_peak(&self, used: usize) {
        self.peak_used.fetch_max(used, Ordering::Relaxed);
    }

    pub fn record_hooks(&self, installed: usize, failed: usize) {
        self.hooks_installed.fetch_add(installed as u64, Ordering::Relaxed);
        self.hooks_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_hooks_restored(&self, restored: usize) {
        self.hooks_restored.fetch_add(restored as u64, Ordering::Relaxed);
    }

    pub fn record_patches(&self, applied: usize, failed: usize) {
        self.patches_applied.fetch_add(applied as u64, Ordering::Relaxed);
        self.patches_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn fallback_allocations(&self) -> u64 {
        self.fallback_allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn peak_used(&self) -> usize {
        self.peak_used.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, pool: PoolGauge) -> StatsSnapshot {
        let now = Utc::now();
        StatsSnapshot {
            initialized_at: self.initialized_at,
            uptime_secs: (now - self.initialized_at).num_seconds(),
            pool,
            allocations: self.allocations.load(Ordering::Relaxed),
            fallback_allocations: self.fallback_allocations.load(Ordering::Relaxed),
            zeroed_allocations: self.zeroed_allocations.load(Ordering::Relaxed),
            reallocations: self.reallocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            pool_frees: self.pool_frees.load(Ordering::Relaxed),
            foreign_frees: self.foreign_frees.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            peak_used: self.peak_used.load(Ordering::Relaxed).max(pool.used),
            hooks_installed: self.hooks_installed.load(Ordering::Relaxed),
            hooks_failed: self.hooks_failed.load(Ordering::Relaxed),
            hooks_restored: self.hooks_restored.load(Ordering::Relaxed),
            patches_applied: self.patches_applied.load(Ordering::Relaxed),
            patches_failed: self.patches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Pool state that lives outside the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolGauge {
    pub active: bool,
    pub hooked: bool,
    pub capacity: usize,
    pub used: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub initialized_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub pool: PoolGauge,
    pub allocations: u64,
    pub fallback_allocations: u64,
    pub zeroed_allocations: u64,
    pub reallocations: u64,
    pub frees: u64,
    pub pool_frees: u64,
    pub foreign_frees: u64,
    pub bytes_allocated: u64,
    pub peak_used: usize,
    pub hooks_installed: u64,
    pub hooks_failed: u64,
    pub hooks_restored: u64,
    pub patches_applied: u64,
    pub patches_failed: u64,
}

impl StatsSnapshot {
    pub fn usage_mb(&self) -> f64 {
        self.pool.used as f64 / MB
    }

    pub fn capacity_mb(&self) -> f64 {
        self.pool.capacity as f64 / MB
    }

    pub fn peak_mb(&self) -> f64 {
        self.peak_used as f64 / MB
    }

    pub fn usage_percent(&self) -> f64 {
        if self.pool.capacity == 0 {
            0.0
        } else {
            self.pool.used as f64 * 100.0 / self.pool.capacity as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        writeln!(f, "=== Overdrive statistics ===")?;
        writeln!(
            f,
            "Initialized:   {} (uptime {}s)",
            self.initialized_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.uptime_secs
        )?;
        writeln!(f, "Pool active:   {}", yes_no(self.pool.active))?;
        writeln!(f, "Hooks active:  {}", yes_no(self.pool.hooked))?;
        writeln!(
            f,
            "Pool usage:    {:.1} / {:.1} MB ({:.1}%), peak {:.1} MB",
            self.usage_mb(),
            self.capacity_mb(),
            self.usage_percent(),
            self.peak_mb()
        )?;
        writeln!(
            f,
            "Allocations:   {} pool, {} fallback, {} zeroed, {} realloc",
            self.allocations, self.fallback_allocations, self.zeroed_allocations, self.reallocations
        )?;
        writeln!(
            f,
            "Frees:         {} ({} pool, {} forwarded)",
            self.frees, self.pool_frees, self.foreign_frees
        )?;
        writeln!(
            f,
            "Hooks:         {} installed, {} failed, {} restored",
            self.hooks_installed, self.hooks_failed, self.hooks_restored
        )?;
        write!(
            f,
            "Patches:       {} applied, {} failed",
            self.patches_applied, self.patches_failed
        )
    }
}
