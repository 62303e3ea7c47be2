//! Scheduler configuration
//!
//! The boot-parameter surface is a plain struct validated once at
//! construction; the runtime-adjustable knobs live in atomics so tick
//! paths read them without taking any lock.

use core::sync::atomic::{AtomicU32, Ordering};

use log::warn;

use crate::types::{
    DEFAULT_RATELIMIT_US, DEFAULT_TSLICE_US, RATELIMIT_US_MAX, RATELIMIT_US_MIN, TICKS_PER_TSLICE,
    TSLICE_US_MAX, TSLICE_US_MIN,
};

/// Boot-time scheduler parameters.
#[derive(Clone, Copy, Debug)]
pub struct SchedParams {
    /// Default accounting period (time slice) in microseconds.
    pub tslice_us: u32,
    /// Minimum time a vCPU runs before it can be preempted, microseconds.
    /// Zero disables rate limiting.
    pub ratelimit_us: u32,
    /// Age below which a vCPU is considered cache-hot and not stolen,
    /// microseconds.
    pub vcpu_migration_delay_us: u32,
    /// When set, `yield` is a no-op.
    pub default_yield: bool,
    /// Tickle a single idle pCPU (round-robin) instead of every idler.
    pub tickle_one_idle: bool,
    /// Consolidate work onto busy sockets instead of spreading it.
    pub smt_power_savings: bool,
    /// Drop over-earning control-domain vCPUs out of credit accounting
    /// instead of halving their credit.
    pub privileged_excess_drop: bool,
}

impl Default for SchedParams {
    fn default() -> SchedParams {
        SchedParams {
            tslice_us: DEFAULT_TSLICE_US,
            ratelimit_us: DEFAULT_RATELIMIT_US,
            vcpu_migration_delay_us: 0,
            default_yield: false,
            tickle_one_idle: true,
            smt_power_savings: false,
            privileged_excess_drop: true,
        }
    }
}

/// Validated global parameters, shared lock-free with every pCPU.
#[derive(Debug)]
pub(crate) struct GlobalParams {
    tslice_us: AtomicU32,
    tick_period_us: AtomicU32,
    ticks_per_tslice: AtomicU32,
    credits_per_tslice: AtomicU32,
    ratelimit_us: AtomicU32,
    vcpu_migration_delay_us: AtomicU32,
    pub default_yield: bool,
    pub tickle_one_idle: bool,
    pub smt_power_savings: bool,
    pub privileged_excess_drop: bool,
}

impl GlobalParams {
    /// Build validated parameters, clamping out-of-range values back to
    /// their defaults.
    pub fn new(params: SchedParams) -> GlobalParams {
        let mut tslice = params.tslice_us;
        if !(TSLICE_US_MIN..=TSLICE_US_MAX).contains(&tslice) {
            warn!(
                "tslice_us {} outside of valid range [{},{}], resetting to default {}",
                tslice, TSLICE_US_MIN, TSLICE_US_MAX, DEFAULT_TSLICE_US
            );
            tslice = DEFAULT_TSLICE_US;
        }

        let mut ratelimit = params.ratelimit_us;
        if ratelimit != 0 && !(RATELIMIT_US_MIN..=RATELIMIT_US_MAX).contains(&ratelimit) {
            warn!(
                "ratelimit_us {} outside of valid range [{},{}], resetting to default {}",
                ratelimit, RATELIMIT_US_MIN, RATELIMIT_US_MAX, DEFAULT_RATELIMIT_US
            );
            ratelimit = DEFAULT_RATELIMIT_US;
        }
        if ratelimit > tslice {
            warn!("ratelimit_us > tslice_us is undefined, setting ratelimit_us to {tslice}");
            ratelimit = tslice;
        }

        let global = GlobalParams {
            tslice_us: AtomicU32::new(0),
            tick_period_us: AtomicU32::new(0),
            ticks_per_tslice: AtomicU32::new(0),
            credits_per_tslice: AtomicU32::new(0),
            ratelimit_us: AtomicU32::new(ratelimit),
            vcpu_migration_delay_us: AtomicU32::new(params.vcpu_migration_delay_us),
            default_yield: params.default_yield,
            tickle_one_idle: params.tickle_one_idle,
            smt_power_savings: params.smt_power_savings,
            privileged_excess_drop: params.privileged_excess_drop,
        };
        global.apply_tslice(tslice);
        global
    }

    /// Publish a new accounting period and its derived quantities.
    pub fn apply_tslice(&self, tslice_us: u32) {
        let ticks = if tslice_us < TICKS_PER_TSLICE {
            1
        } else {
            TICKS_PER_TSLICE
        };
        self.tslice_us.store(tslice_us, Ordering::Relaxed);
        self.ticks_per_tslice.store(ticks, Ordering::Relaxed);
        self.tick_period_us
            .store(tslice_us / ticks, Ordering::Relaxed);
        self.credits_per_tslice
            .store(crate::types::CREDITS_PER_US * tslice_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn tslice_us(&self) -> u32 {
        self.tslice_us.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tick_period_us(&self) -> u32 {
        self.tick_period_us.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ticks_per_tslice(&self) -> u32 {
        self.ticks_per_tslice.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn credits_per_tslice(&self) -> u32 {
        self.credits_per_tslice.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ratelimit_us(&self) -> u32 {
        self.ratelimit_us.load(Ordering::Relaxed)
    }

    pub fn set_ratelimit_us(&self, us: u32) {
        self.ratelimit_us.store(us, Ordering::Relaxed);
    }

    #[inline]
    pub fn vcpu_migration_delay_us(&self) -> u32 {
        self.vcpu_migration_delay_us.load(Ordering::Relaxed)
    }

    pub fn set_vcpu_migration_delay_us(&self, us: u32) {
        self.vcpu_migration_delay_us.store(us, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_tslice_resets_to_default() {
        let params = GlobalParams::new(SchedParams {
            tslice_us: 50_000,
            ..SchedParams::default()
        });
        assert_eq!(params.tslice_us(), DEFAULT_TSLICE_US);
    }

    #[test]
    fn ratelimit_clamped_to_tslice() {
        let params = GlobalParams::new(SchedParams {
            tslice_us: 500,
            ratelimit_us: 1000,
            ..SchedParams::default()
        });
        assert_eq!(params.ratelimit_us(), 500);
    }

    #[test]
    fn derived_quantities_follow_tslice() {
        let params = GlobalParams::new(SchedParams {
            tslice_us: 900,
            ratelimit_us: 300,
            ..SchedParams::default()
        });
        assert_eq!(params.ticks_per_tslice(), TICKS_PER_TSLICE);
        assert_eq!(params.tick_period_us(), 300);
        assert_eq!(params.credits_per_tslice(), 900);

        params.apply_tslice(2);
        assert_eq!(params.ticks_per_tslice(), 1);
        assert_eq!(params.tick_period_us(), 2);
    }
}
