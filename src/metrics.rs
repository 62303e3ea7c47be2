//! PMC sampling and the adaptive time-slice controller
//!
//! Every pCPU runs a 1 ms metric tick; only the master does the global
//! work. For each domain the master sums the per-vCPU PMC deltas since the
//! last pass and feeds them, together with the spinlock-latency window, to
//! a per-domain closed loop: cache-pressured domains get a longer slice
//! (amortising warm-up), spin-dominated domains get a shorter one
//! (reducing lock-holder preemption).

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use log::debug;

use crate::core::CreditScheduler;
use crate::domain::{MetricState, Sdom};
use crate::types::{
    us_to_ns, EventSample, Phase, EVENT_TRACKING_WINDOW, METRIC_TICK_PERIOD_US,
    SLICE_APPLY_PERIOD_US,
};
use crate::upcalls::{Hypervisor, TimerKind};

/// Spinlock ring entries at or below this latency are treated as noise
/// when averaging the window, nanoseconds.
const SPINLOCK_NOISE_FLOOR_NS: u64 = 10_000;

impl<H: Hypervisor> CreditScheduler<H> {
    /// Per-pCPU metric tick on its fixed 1 ms cadence.
    pub fn metric_tick(&self, cpu: u32) {
        let Some(pcpu) = self.pcpu(cpu) else {
            return;
        };

        // In short-slice mode the hardware counters are flushed into the
        // per-vCPU mirrors on this cadence rather than at the tick.
        if self.params.tslice_us() <= 1111 {
            let curr = pcpu.sched.lock().curr.clone();
            self.hyp.pmu_save_regs(curr.id);
            self.hyp.pmu_restore_regs(curr.id);
        }

        self.dom_metric_update(cpu);

        let now = self.hyp.now();
        self.hyp.set_timer(
            TimerKind::Metric,
            cpu,
            now + us_to_ns(METRIC_TICK_PERIOD_US),
        );
    }

    /// The quiescent pool-wide slice pass; kept armed for future use.
    pub fn slice_tick(&self) {
        let now = self.hyp.now();
        if let Some(master) = self.prv.lock().master {
            self.hyp.set_timer(
                TimerKind::Slice,
                master,
                now + us_to_ns(SLICE_APPLY_PERIOD_US),
            );
        }
    }

    /// Master-only: refresh every domain's PMC interval and run its slice
    /// controller. Non-master pCPUs fall straight through.
    fn dom_metric_update(&self, cpu: u32) {
        if self.prv.lock().master != Some(cpu) {
            return;
        }

        let sdoms: Vec<Arc<Sdom>> = self.doms.read().values().cloned().collect();

        for sdom in sdoms {
            sdom.pending_requests.store(
                self.hyp.take_pending_requests(sdom.dom),
                Ordering::Relaxed,
            );

            // Per-vCPU deltas since the previous pass, summed per domain.
            let mut delta = [0u64; 4];
            for svc in sdom.vcpus.lock().iter() {
                let pmc = self.hyp.vcpu_pmc(svc.id);
                let mut prev = svc.prev_pmc.lock();
                for i in 0..4 {
                    delta[i] += pmc[i].wrapping_sub(prev[i]);
                }
                *prev = pmc;
            }

            let inst = delta[0];
            let cycles = delta[1];
            let misses = delta[3];

            {
                let mut metrics = sdom.metrics.lock();
                metrics.pmc = delta;
                self.slice_controller(&sdom, &mut metrics, inst, misses);
            }

            sdom.cache_miss_rate.store(
                if inst != 0 {
                    (misses * 100_000 / inst) as u32
                } else {
                    0
                },
                Ordering::Relaxed,
            );
            sdom.cpi.store(
                if inst != 0 {
                    (cycles * 1000 / inst) as u32
                } else {
                    0
                },
                Ordering::Relaxed,
            );

            sdom.clear_spin_window();
        }
    }

    /// One controller pass over a domain's last-interval sample.
    fn slice_controller(
        &self,
        sdom: &Sdom,
        metrics: &mut MetricState,
        inst_retired: u64,
        cache_misses: u64,
    ) {
        let miss_rate_curr = if inst_retired != 0 {
            cache_misses * 100_000 / inst_retired
        } else {
            0
        };

        let count = sdom.spin_count.load(Ordering::Relaxed);
        let latency = sdom.spin_latency_ns.load(Ordering::Relaxed);
        let avg_spinlock = if count > 0 { latency / count } else { 0 };
        let sample = EventSample {
            spinlock: avg_spinlock,
            inst_retired,
            cache_misses,
        };

        if metrics.tracking_window > 0 {
            // Warm-up: fill the ring before trusting windowed statistics.
            let slot = EVENT_TRACKING_WINDOW - metrics.tracking_window as usize;
            metrics.filter[slot] = sample;
            metrics.tracking_window -= 1;
            if miss_rate_curr > 0 && miss_rate_curr < 100 {
                sdom.decrease_time_slice();
            }
        } else {
            let inst_mean = metrics
                .filter
                .iter()
                .map(|s| s.inst_retired)
                .sum::<u64>()
                / EVENT_TRACKING_WINDOW as u64;
            let miss_mean = metrics
                .filter
                .iter()
                .map(|s| s.cache_misses)
                .sum::<u64>()
                / EVENT_TRACKING_WINDOW as u64;

            // Spinlock average over the window, ignoring noise entries.
            let (mut spin_sum, mut spin_count) = (0u64, 0u64);
            for slot in metrics.filter.iter() {
                if slot.spinlock > SPINLOCK_NOISE_FLOOR_NS {
                    spin_sum += slot.spinlock;
                    spin_count += 1;
                }
            }
            let spinlock_mean = if spin_count > 0 {
                spin_sum / spin_count
            } else {
                0
            };

            let miss_rate_window = if inst_mean > 0 {
                miss_mean * 100_000 / inst_mean
            } else {
                0
            };
            let err = if miss_rate_window > 0 {
                miss_rate_curr * 100 / miss_rate_window
            } else if miss_rate_curr == 0 {
                100
            } else {
                0
            };

            let stable = (70..=130).contains(&err)
                || (err > 130 && miss_rate_window >= 100)
                || (miss_rate_curr < 100 && miss_rate_window < 100);

            if stable {
                metrics.stable_count = metrics.stable_count.saturating_add(1);
                metrics.shift(sample);

                if miss_rate_window >= 100 {
                    metrics.phase = Phase::LowSpin;
                    sdom.increase_time_slice();
                } else {
                    metrics.phase = Phase::HighSpin;
                    sdom.decrease_time_slice();
                }
            } else {
                // The interval disagrees with the window: throw the window
                // away and start tracking again from this sample.
                metrics.reseed(sample);
                if miss_rate_curr < 100 {
                    sdom.decrease_time_slice();
                }
            }

            debug!(
                "{}: miss_rate {}/{} err {} spin_mean {} slice {}us",
                sdom.dom,
                miss_rate_curr,
                miss_rate_window,
                err,
                spinlock_mean,
                sdom.tslice_us()
            );
        }

        sdom.publish_tick_period();
    }

    /// The time slice currently published for a domain, microseconds.
    pub fn domain_slice_us(&self, dom: crate::types::DomainId) -> Option<u32> {
        self.sdom(dom).map(|sdom| sdom.tslice_us())
    }

    /// The controller's current phase classification of a domain.
    pub fn domain_phase(&self, dom: crate::types::DomainId) -> Option<Phase> {
        self.sdom(dom).map(|sdom| sdom.metrics.lock().phase)
    }

    /// Record one paravirt spin wait of the vCPU running on `cpu`,
    /// attributing it to that vCPU's domain.
    pub fn record_spin_latency(&self, cpu: u32, ns: u64) {
        let Some(pcpu) = self.pcpu(cpu) else {
            return;
        };
        let curr = pcpu.sched.lock().curr.clone();
        if let Some(sdom) = curr.sdom.as_ref() {
            sdom.record_spin_latency(ns);
        }
    }
}
