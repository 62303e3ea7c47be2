//! Scheduler type definitions
//!
//! This module contains the identifiers, priority bands, flag words, CPU
//! masks and constants shared by the scheduler subsystem.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use thiserror::Error;

/// Default domain weight.
pub const DEFAULT_WEIGHT: u16 = 256;

/// Ticks per accounting period.
pub const TICKS_PER_TSLICE: u32 = 3;

/// Default accounting period (time slice) in microseconds.
pub const DEFAULT_TSLICE_US: u32 = 100;

/// Credit earned/burned per millisecond of CPU time (1 credit per µs).
pub const CREDITS_PER_MSEC: i64 = 1000;

/// Credits granted per microsecond of accounting period.
pub const CREDITS_PER_US: u32 = 1;

/// Metric sampling cadence in microseconds.
pub const METRIC_TICK_PERIOD_US: u32 = 1000;

/// Cadence of the (currently quiescent) pool-wide slice pass, microseconds.
pub const SLICE_APPLY_PERIOD_US: u32 = 3000;

/// Boundary between the divide-down and subtract-down slice decrease rules.
pub const SWITCH_BOUNDARY_US: u32 = 900;

/// Depth of the per-domain PMC sample ring.
pub const EVENT_TRACKING_WINDOW: usize = 5;

/// Bounds of the adaptive per-domain time slice, microseconds.
pub const SLICE_MIN_US: u32 = 100;
pub const SLICE_MAX_US: u32 = 1100;

/// Valid range for the configured accounting period, microseconds.
pub const TSLICE_US_MIN: u32 = 100;
pub const TSLICE_US_MAX: u32 = 30_000;

/// Valid range for the scheduling rate limit, microseconds.
pub const RATELIMIT_US_MIN: u32 = 100;
pub const RATELIMIT_US_MAX: u32 = 500_000;

/// Default scheduling rate limit, microseconds.
pub const DEFAULT_RATELIMIT_US: u32 = 1000;

/// Largest physical CPU id the scheduler can manage; `CpuMask` is one word.
pub const MAX_PCPUS: usize = 64;

pub(crate) const NSEC_PER_MSEC: i64 = 1_000_000;

#[inline]
pub(crate) const fn us_to_ns(us: u32) -> u64 {
    us as u64 * 1000
}

/// Identifier of a scheduled domain, issued by the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

impl DomainId {
    /// The idle domain; its vCPUs are the per-pCPU idle placeholders.
    pub const IDLE: DomainId = DomainId(u32::MAX);
    /// The hypervisor's control domain.
    pub const CONTROL: DomainId = DomainId(0);

    #[inline]
    pub fn is_idle(self) -> bool {
        self == Self::IDLE
    }

    #[inline]
    pub fn is_privileged(self) -> bool {
        self == Self::CONTROL
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Identifier of a virtual CPU, issued by the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u32);

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Priority band of a vCPU. Derived `Ord` follows declaration order:
/// `Idle < Over < Under < Boost`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Band {
    /// Idle placeholder vCPU of a pCPU.
    Idle,
    /// Time-share vCPU without credits.
    Over,
    /// Time-share vCPU with credits.
    Under,
    /// Time-share vCPU boosted on wake-up.
    Boost,
}

impl Band {
    /// Numeric priority as published in diagnostics.
    pub const fn raw(self) -> i16 {
        match self {
            Band::Boost => 0,
            Band::Under => -1,
            Band::Over => -2,
            Band::Idle => -64,
        }
    }

    pub(crate) fn from_raw(raw: i16) -> Band {
        match raw {
            0 => Band::Boost,
            -1 => Band::Under,
            -2 => Band::Over,
            _ => Band::Idle,
        }
    }
}

bitflags! {
    /// Per-vCPU flag word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VcpuFlags: u16 {
        /// Paused after overspending a capped domain's credits.
        const PARKED = 0x0001;
        /// Yield requested; honoured once at the next runqueue insert.
        const YIELD = 0x0002;
    }
}

/// Phase classification produced by the adaptive slice controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Cache-pressured: longer slices amortise warm-up.
    LowSpin,
    /// Spin-dominated: shorter slices reduce lock-holder preemption.
    HighSpin,
}

/// One slot of the per-domain PMC sample ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventSample {
    /// Average spinlock latency over the interval, nanoseconds.
    pub spinlock: u64,
    /// Instructions retired over the interval.
    pub inst_retired: u64,
    /// Last-level cache misses over the interval.
    pub cache_misses: u64,
}

/// Outcome of a scheduling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskSlice {
    /// The vCPU to run next.
    pub task: VcpuId,
    /// Slice length in nanoseconds; `None` means no preemption timer.
    pub time: Option<u64>,
    /// Whether the task was stolen from another pCPU.
    pub migrated: bool,
}

/// Errors surfaced to the hypervisor by scheduler operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    /// A per-pCPU/vCPU/domain record could not be allocated or registered.
    #[error("scheduler capacity exhausted")]
    CapacityExhausted,
    /// A configuration value is outside its permitted range.
    #[error("parameter out of range")]
    InvalidParameter,
    #[error("unknown domain")]
    UnknownDomain,
    #[error("unknown vcpu")]
    UnknownVcpu,
    #[error("unknown pcpu")]
    UnknownPcpu,
}

/// A set of physical CPUs (one bit per pCPU).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuMask(pub u64);

impl CpuMask {
    pub const fn empty() -> CpuMask {
        CpuMask(0)
    }

    pub const fn single(cpu: u32) -> CpuMask {
        CpuMask(1 << cpu)
    }

    pub const fn all() -> CpuMask {
        CpuMask(u64::MAX)
    }

    #[inline]
    pub fn set(&mut self, cpu: u32) {
        self.0 |= 1 << cpu;
    }

    #[inline]
    pub fn clear(&mut self, cpu: u32) {
        self.0 &= !(1 << cpu);
    }

    #[inline]
    pub fn test(self, cpu: u32) -> bool {
        self.0 & (1 << cpu) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the mask.
    #[inline]
    pub fn weight(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn and(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    #[inline]
    pub fn andnot(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & !other.0)
    }

    #[inline]
    pub fn or(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 | other.0)
    }

    /// Lowest CPU id in the mask.
    pub fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    /// Next CPU in the mask after `after`, wrapping around.
    pub fn cycle(self, after: u32) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let start = (after as usize + 1) % MAX_PCPUS;
        for off in 0..MAX_PCPUS {
            let cpu = ((start + off) % MAX_PCPUS) as u32;
            if self.test(cpu) {
                return Some(cpu);
            }
        }
        None
    }

    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..MAX_PCPUS as u32).filter(move |&cpu| self.test(cpu))
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A `CpuMask` shared between pCPUs; bit updates are atomic.
#[derive(Debug, Default)]
pub(crate) struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new() -> AtomicCpuMask {
        AtomicCpuMask(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, cpu: u32) {
        self.0.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, cpu: u32) {
        self.0.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    #[inline]
    pub fn test(&self, cpu: u32) -> bool {
        self.load().test(cpu)
    }
}
