//! Scheduled-domain records
//!
//! An [`Sdom`] carries a domain's share parameters (weight, cap), its
//! adaptive time slice as published by the master pCPU, the spinlock
//! latency window fed by the paravirt callback, and the controller state
//! used by the metric pass.
//!
//! `tslice_us`/`tick_period_us` are written only by the master and read by
//! every pCPU without locking; they are relaxed atomics and readers
//! tolerate a stale value for at most one tick.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::types::{
    DomainId, EventSample, Phase, DEFAULT_TSLICE_US, DEFAULT_WEIGHT, EVENT_TRACKING_WINDOW,
    SLICE_MAX_US, SLICE_MIN_US, SWITCH_BOUNDARY_US, TICKS_PER_TSLICE,
};
use crate::vcpu::Svcpu;

/// Controller state owned by the master pCPU.
#[derive(Debug)]
pub(crate) struct MetricState {
    /// Ring of the most recent interval samples.
    pub filter: [EventSample; EVENT_TRACKING_WINDOW],
    /// Remaining warm-up slots before the ring is considered full.
    pub tracking_window: u8,
    /// Consecutive passes the window agreed with the current interval.
    pub stable_count: u8,
    pub phase: Phase,
    /// Last-interval PMC deltas: instructions, cycles, LLC refs, LLC misses.
    pub pmc: [u64; 4],
}

impl MetricState {
    pub fn new() -> MetricState {
        MetricState {
            filter: [EventSample::default(); EVENT_TRACKING_WINDOW],
            tracking_window: EVENT_TRACKING_WINDOW as u8,
            stable_count: 0,
            phase: Phase::LowSpin,
            pmc: [0; 4],
        }
    }

    /// Push a sample at the tail of the ring, dropping the oldest.
    pub fn shift(&mut self, sample: EventSample) {
        self.filter.copy_within(1.., 0);
        self.filter[EVENT_TRACKING_WINDOW - 1] = sample;
    }

    /// Forget the window and restart warm-up from this sample.
    pub fn reseed(&mut self, sample: EventSample) {
        self.filter = [EventSample::default(); EVENT_TRACKING_WINDOW];
        self.filter[0] = sample;
        self.tracking_window = (EVENT_TRACKING_WINDOW - 1) as u8;
        self.stable_count = 0;
    }
}

/// Per-domain scheduler state.
#[derive(Debug)]
pub(crate) struct Sdom {
    pub dom: DomainId,
    pub weight: AtomicU16,
    /// Cap in percent of one CPU; 0 means uncapped.
    pub cap: AtomicU16,
    /// Adaptive time slice, published by the master.
    pub tslice_us: AtomicU32,
    /// Tick period derived from the slice, published by the master.
    pub tick_period_us: AtomicU32,

    /// Every vCPU belonging to this domain.
    pub vcpus: Mutex<Vec<Arc<Svcpu>>>,
    /// vCPUs currently participating in credit accounting. Taken only
    /// under the scheduler-wide lock.
    pub active_vcpu: Mutex<Vec<Arc<Svcpu>>>,
    pub active_vcpu_count: AtomicU16,

    /// Spinlock latency accumulated since the last controller pass.
    pub spin_latency_ns: AtomicU64,
    pub spin_count: AtomicU64,

    /// Pending-request counter sampled from the domain each metric pass.
    pub pending_requests: AtomicU64,
    /// LLC misses x 100000 per instruction, last interval.
    pub cache_miss_rate: AtomicU32,
    /// Cycles x 1000 per instruction, last interval.
    pub cpi: AtomicU32,

    pub metrics: Mutex<MetricState>,
}

impl Sdom {
    pub fn new(dom: DomainId) -> Sdom {
        Sdom {
            dom,
            weight: AtomicU16::new(DEFAULT_WEIGHT),
            cap: AtomicU16::new(0),
            tslice_us: AtomicU32::new(DEFAULT_TSLICE_US),
            tick_period_us: AtomicU32::new(DEFAULT_TSLICE_US / TICKS_PER_TSLICE),
            vcpus: Mutex::new(Vec::new()),
            active_vcpu: Mutex::new(Vec::new()),
            active_vcpu_count: AtomicU16::new(0),
            spin_latency_ns: AtomicU64::new(0),
            spin_count: AtomicU64::new(0),
            pending_requests: AtomicU64::new(0),
            cache_miss_rate: AtomicU32::new(0),
            cpi: AtomicU32::new(0),
            metrics: Mutex::new(MetricState::new()),
        }
    }

    #[inline]
    pub fn tslice_us(&self) -> u32 {
        self.tslice_us.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tick_period_us(&self) -> u32 {
        self.tick_period_us.load(Ordering::Relaxed)
    }

    /// Shrink the time slice one step: divide-down above three times the
    /// switch boundary, otherwise subtract, never below the floor.
    pub fn decrease_time_slice(&self) {
        let tslice = self.tslice_us();
        let next = if tslice >= SWITCH_BOUNDARY_US * 3 {
            tslice / 300 * 100
        } else if tslice >= 300 {
            tslice - 200
        } else {
            SLICE_MIN_US
        };
        self.tslice_us.store(next, Ordering::Relaxed);
    }

    /// Grow the time slice one step, never above the ceiling.
    pub fn increase_time_slice(&self) {
        let tslice = self.tslice_us();
        let next = (tslice + 100).min(SLICE_MAX_US);
        self.tslice_us.store(next, Ordering::Relaxed);
    }

    /// Re-derive the tick period from the current slice.
    pub fn publish_tick_period(&self) {
        self.tick_period_us
            .store(self.tslice_us() / TICKS_PER_TSLICE, Ordering::Relaxed);
    }

    /// Record one paravirt spin wait.
    pub fn record_spin_latency(&self, ns: u64) {
        self.spin_latency_ns.fetch_add(ns, Ordering::Relaxed);
        self.spin_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the spinlock window after a controller pass.
    pub fn clear_spin_window(&self) {
        self.spin_latency_ns.store(0, Ordering::Relaxed);
        self.spin_count.store(0, Ordering::Relaxed);
    }
}
