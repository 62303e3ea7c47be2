//! Virtual-CPU records and credit burn
//!
//! An [`Svcpu`] is shared between its pCPU's dispatch path, the tick
//! handler and the master accountant, so its hot fields are atomics: the
//! credit counter uses relaxed loads and acquire/release only where the
//! master commits a band transition.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::domain::Sdom;
use crate::types::{Band, VcpuFlags, VcpuId, CREDITS_PER_MSEC, NSEC_PER_MSEC};

/// Per-vCPU counters, kept with relaxed ordering and surfaced in dumps.
#[derive(Debug, Default)]
pub(crate) struct VcpuStats {
    pub credit_last: AtomicI32,
    pub credit_incr: AtomicU32,
    pub state_active: AtomicU32,
    pub state_idle: AtomicU32,
    pub migrate_q: AtomicU32,
    pub migrate_r: AtomicU32,
}

/// Per-vCPU scheduler state.
#[derive(Debug)]
pub(crate) struct Svcpu {
    pub id: VcpuId,
    /// Owning domain; `None` for the idle placeholder vCPUs.
    pub sdom: Option<Arc<Sdom>>,
    pub credit: AtomicI32,
    pri: AtomicI16,
    flags: AtomicU16,
    /// The pCPU this vCPU is assigned to; reassigned on steal.
    pub processor: AtomicU32,
    /// Dispatch timestamp basis for credit burn, nanoseconds. The
    /// dispatch path offsets it by `-now`/`+now` so each burn measures
    /// only the time actually run.
    pub start_time: AtomicI64,
    /// When this vCPU last ran; drives the cache-hot test.
    pub last_run: AtomicU64,
    /// Runqueue membership; maintained under the owning pCPU's lock.
    pub on_runq: AtomicBool,
    /// Credit-accounting membership; maintained under the scheduler lock.
    pub active: AtomicBool,
    /// PMC snapshot at the last metric pass; master pCPU only.
    pub prev_pmc: Mutex<[u64; 4]>,
    pub stats: VcpuStats,
}

impl Svcpu {
    pub fn new(id: VcpuId, sdom: Option<Arc<Sdom>>) -> Svcpu {
        let pri = if sdom.is_some() { Band::Under } else { Band::Idle };
        Svcpu {
            id,
            sdom,
            credit: AtomicI32::new(0),
            pri: AtomicI16::new(pri.raw()),
            flags: AtomicU16::new(0),
            processor: AtomicU32::new(0),
            start_time: AtomicI64::new(0),
            last_run: AtomicU64::new(0),
            on_runq: AtomicBool::new(false),
            active: AtomicBool::new(false),
            prev_pmc: Mutex::new([0; 4]),
            stats: VcpuStats::default(),
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.sdom.is_none()
    }

    #[inline]
    pub fn band(&self) -> Band {
        Band::from_raw(self.pri.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_band(&self, band: Band) {
        self.pri.store(band.raw(), Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> VcpuFlags {
        VcpuFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn test_flag(&self, flag: VcpuFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: VcpuFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: VcpuFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Convert time run since `start_time` into burned credits, at 1000
    /// credits per millisecond rounded to nearest. `start_time` advances
    /// by the exact time those credits represent, so the sub-credit
    /// remainder carries into the next burn.
    pub fn burn_credits(&self, now: u64) {
        let delta = now as i64 - self.start_time.load(Ordering::Relaxed);
        if delta <= 0 {
            return;
        }

        let credits = (delta * CREDITS_PER_MSEC + NSEC_PER_MSEC / 2) / NSEC_PER_MSEC;
        self.credit.fetch_sub(credits as i32, Ordering::Relaxed);
        self.start_time
            .fetch_add(credits * NSEC_PER_MSEC / CREDITS_PER_MSEC, Ordering::Relaxed);
    }
}
