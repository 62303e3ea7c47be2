//! Master credit accounting
//!
//! Once per accounting period the master pCPU converts domain weights
//! into per-vCPU credit grants and reassigns priority bands. The whole
//! pass runs under the scheduler-wide lock; the other pCPUs pick the new
//! bands up through the sort epoch at their next tick.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use crate::core::{CreditScheduler, PrivState};
use crate::domain::Sdom;
use crate::types::{us_to_ns, Band, VcpuFlags};
use crate::upcalls::{Hypervisor, TimerKind};
use crate::vcpu::Svcpu;

impl<H: Hypervisor> CreditScheduler<H> {
    /// Join credit accounting: charge the domain's weight to the pool and
    /// put the vCPU (and, if needed, its domain) on the active lists.
    pub(crate) fn vcpu_acct_start(&self, svc: &Arc<Svcpu>) {
        let Some(sdom) = svc.sdom.as_ref() else {
            return;
        };

        let mut prv = self.prv.lock();
        if svc.active.load(Ordering::Relaxed) {
            return;
        }

        svc.stats.state_active.fetch_add(1, Ordering::Relaxed);

        sdom.active_vcpu_count.fetch_add(1, Ordering::Relaxed);
        sdom.active_vcpu.lock().push(svc.clone());
        svc.active.store(true, Ordering::Relaxed);
        prv.weight += sdom.weight.load(Ordering::Relaxed) as u32;

        if !prv.active_sdom.iter().any(|d| Arc::ptr_eq(d, sdom)) {
            prv.active_sdom.insert(0, sdom.clone());
        }
    }

    /// Leave credit accounting; caller holds the scheduler lock.
    pub(crate) fn vcpu_acct_stop_locked(
        &self,
        prv: &mut PrivState,
        sdom: &Arc<Sdom>,
        svc: &Arc<Svcpu>,
    ) {
        debug_assert!(svc.active.load(Ordering::Relaxed));

        svc.stats.state_idle.fetch_add(1, Ordering::Relaxed);

        sdom.active_vcpu_count.fetch_sub(1, Ordering::Relaxed);
        let mut active = sdom.active_vcpu.lock();
        if let Some(pos) = active.iter().position(|v| v.id == svc.id) {
            active.remove(pos);
        }
        let emptied = active.is_empty();
        drop(active);

        svc.active.store(false, Ordering::Relaxed);

        let weight = sdom.weight.load(Ordering::Relaxed) as u32;
        debug_assert!(prv.weight >= weight);
        prv.weight -= weight;

        if emptied {
            if let Some(pos) = prv.active_sdom.iter().position(|d| Arc::ptr_eq(d, sdom)) {
                prv.active_sdom.remove(pos);
            }
        }
    }

    /// The master accounting pass. Fires once per accounting period on the
    /// master pCPU.
    pub fn acct(&self) {
        self.do_acct();

        let now = self.hyp.now();
        if let Some(master) = self.prv.lock().master {
            self.hyp.set_timer(
                TimerKind::Master,
                master,
                now + us_to_ns(self.params.tslice_us()),
            );
        }
    }

    fn do_acct(&self) {
        let mut prv = self.prv.lock();

        let credits_per_tslice = self.params.credits_per_tslice();
        let weight_total = prv.weight;
        let mut credit_total = prv.credit as u64;

        // Converge the balance towards zero when it has gone negative.
        if prv.credit_balance < 0 {
            credit_total += (-prv.credit_balance) as u64;
            self.stats.acct_balance.fetch_add(1, Ordering::Relaxed);
        }

        if weight_total == 0 {
            prv.credit_balance = 0;
            self.stats.acct_no_work.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.acct_run.fetch_add(1, Ordering::Relaxed);

        let mut weight_left = weight_total as u64;
        let mut credit_balance: i64 = 0;
        let mut credit_xtra = false;

        // The pass may reorder the active list; iterate a snapshot of it.
        let sdoms: Vec<Arc<Sdom>> = prv.active_sdom.clone();

        for sdom in &sdoms {
            let active_count = sdom.active_vcpu_count.load(Ordering::Relaxed) as u64;
            let weight = sdom.weight.load(Ordering::Relaxed) as u64;
            let cap = sdom.cap.load(Ordering::Relaxed) as u64;

            debug_assert!(!sdom.dom.is_idle());
            debug_assert!(active_count > 0);
            debug_assert!(weight * active_count <= weight_left);

            weight_left -= weight * active_count;

            // A domain's fair share competes its weight against every other
            // active domain's. It can at most bank enough to run all its
            // active vCPUs for one full period, unless the pool balance is
            // negative and the shortfall is handed back proportionally.
            let mut credit_peak = active_count * credits_per_tslice as u64;
            if prv.credit_balance < 0 {
                credit_peak += ((-prv.credit_balance) as u64 * weight * active_count
                    + (weight_total as u64 - 1))
                    / weight_total as u64;
            }

            let mut credit_cap = 0u64;
            if cap != 0 {
                credit_cap = (cap * credits_per_tslice as u64 + 99) / 100;
                if credit_cap < credit_peak {
                    credit_peak = credit_cap;
                }
                credit_cap = (credit_cap + active_count - 1) / active_count;
            }

            let mut credit_fair = (credit_total * weight * active_count
                + (weight_total as u64 - 1))
                / weight_total as u64;

            if credit_fair < credit_peak {
                credit_xtra = true;
            } else {
                if weight_left != 0 {
                    // Hand unused credit to the domains still to come.
                    credit_total += ((credit_fair - credit_peak) * weight_total as u64
                        + (weight_left - 1))
                        / weight_left;
                }

                if credit_xtra {
                    // Lazily keep surplus domains at the head of the list so
                    // the others get first pick of leftovers next period.
                    self.stats.acct_reorder.fetch_add(1, Ordering::Relaxed);
                    if let Some(pos) =
                        prv.active_sdom.iter().position(|d| Arc::ptr_eq(d, sdom))
                    {
                        let dom = prv.active_sdom.remove(pos);
                        prv.active_sdom.insert(0, dom);
                    }
                }

                credit_fair = credit_peak;
            }

            // Fair share per vCPU, rounded up.
            credit_fair = (credit_fair + active_count - 1) / active_count;

            let vcpus: Vec<Arc<Svcpu>> = sdom.active_vcpu.lock().clone();
            for svc in &vcpus {
                svc.credit.fetch_add(credit_fair as i32, Ordering::Relaxed);
                let mut credit = svc.credit.load(Ordering::Relaxed);

                if credit < 0 {
                    svc.set_band(Band::Over);

                    // Park running vCPUs of capped-out domains.
                    if cap != 0
                        && credit < -(credit_cap as i32)
                        && !svc.test_flag(VcpuFlags::PARKED)
                    {
                        self.stats.vcpu_park.fetch_add(1, Ordering::Relaxed);
                        self.hyp.vcpu_pause_nosync(svc.id);
                        svc.set_flag(VcpuFlags::PARKED);
                    }

                    if credit < -(credits_per_tslice as i32) {
                        self.stats.acct_min_credit.fetch_add(1, Ordering::Relaxed);
                        credit = -(credits_per_tslice as i32);
                        svc.credit.store(credit, Ordering::Relaxed);
                    }
                } else {
                    svc.set_band(Band::Under);

                    if svc.test_flag(VcpuFlags::PARKED) {
                        // Unpause first: a wake-up arriving between the two
                        // steps must not see PARKED already clear and boost
                        // the vCPU.
                        self.stats.vcpu_unpark.fetch_add(1, Ordering::Relaxed);
                        self.hyp.vcpu_unpause(svc.id);
                        svc.clear_flag(VcpuFlags::PARKED);
                    }

                    // Upper bound: a vCPU that keeps earning more than it can
                    // spend stops banking it.
                    if credit / 100 > credits_per_tslice as i32 / 100 {
                        if sdom.dom.is_privileged() && self.params.privileged_excess_drop {
                            if sdom.active_vcpu_count.load(Ordering::Relaxed) >= 2 {
                                self.vcpu_acct_stop_locked(&mut prv, sdom, svc);
                            }
                        } else {
                            credit /= 2;
                            svc.credit.store(credit, Ordering::Relaxed);
                        }
                    }
                }

                svc.stats.credit_last.store(credit, Ordering::Relaxed);
                svc.stats
                    .credit_incr
                    .store(credit_fair as u32, Ordering::Relaxed);
                credit_balance += credit as i64;
            }
        }

        prv.credit_balance = credit_balance as i32;
        drop(prv);

        // Tell every pCPU its runq wants sorting against the new bands.
        self.runq_sort.fetch_add(1, Ordering::Release);
    }
}
