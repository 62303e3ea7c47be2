//! Scheduler core
//!
//! [`CreditScheduler`] is the entry point the hypervisor drives: domain
//! and vCPU lifecycle, wake/sleep/yield, per-domain and global parameter
//! control, pCPU bring-up with master election, and the dispatch decision
//! itself.
//!
//! Lock order: cpupool lock (caller's) -> scheduler lock -> pCPU schedule
//! lock. Peer pCPU schedule locks are only ever try-locked, from the
//! steal path.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, info};
use spin::{Mutex, RwLock};

use crate::config::{GlobalParams, SchedParams};
use crate::domain::Sdom;
use crate::pcpu::{PcpuRunState, PcpuState};
use crate::stats::SchedStats;
use crate::types::{
    us_to_ns, AtomicCpuMask, Band, CpuMask, DomainId, SchedError, TaskSlice, VcpuFlags, VcpuId,
    METRIC_TICK_PERIOD_US, RATELIMIT_US_MAX, RATELIMIT_US_MIN, SLICE_APPLY_PERIOD_US,
    TSLICE_US_MAX, TSLICE_US_MIN,
};
use crate::upcalls::{Hypervisor, TimerKind};
use crate::vcpu::Svcpu;

/// Weight and cap of one domain, as read or written through [`adjust`].
///
/// [`adjust`]: CreditScheduler::adjust
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainSchedInfo {
    pub weight: u16,
    /// Percent of one CPU; 0 means uncapped.
    pub cap: u16,
}

/// Per-domain control operation.
#[derive(Clone, Copy, Debug)]
pub enum DomainOp {
    GetInfo,
    PutInfo {
        weight: Option<u16>,
        cap: Option<u16>,
    },
}

/// Global scheduler knobs, as read or written through [`adjust_global`].
///
/// [`adjust_global`]: CreditScheduler::adjust_global
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalSchedInfo {
    pub tslice_us: u32,
    pub ratelimit_us: u32,
}

/// Global control operation.
#[derive(Clone, Copy, Debug)]
pub enum GlobalOp {
    GetInfo,
    PutInfo {
        tslice_us: u32,
        ratelimit_us: u32,
    },
}

/// State guarded by the scheduler-wide lock.
#[derive(Debug, Default)]
pub(crate) struct PrivState {
    /// Active domains; the accountant lazily reorders this list.
    pub active_sdom: Vec<Arc<Sdom>>,
    pub ncpus: u32,
    /// The pCPU running the accountant and the controller.
    pub master: Option<u32>,
    /// Sum over active domains of weight x active vCPU count.
    pub weight: u32,
    /// Credit issued per accounting period across the pool.
    pub credit: u32,
    /// Residual credit left in vCPUs after the last accounting pass.
    pub credit_balance: i32,
}

/// The credit scheduler instance handed to the hypervisor.
pub struct CreditScheduler<H: Hypervisor> {
    pub(crate) hyp: H,
    pub(crate) params: GlobalParams,
    pub(crate) prv: Mutex<PrivState>,
    pub(crate) doms: RwLock<BTreeMap<DomainId, Arc<Sdom>>>,
    pub(crate) vcpus: RwLock<BTreeMap<VcpuId, Arc<Svcpu>>>,
    pub(crate) pcpus: RwLock<BTreeMap<u32, Arc<PcpuState>>>,
    /// pCPUs currently running their idle vCPU.
    pub(crate) idlers: AtomicCpuMask,
    /// pCPUs owned by this scheduler.
    pub(crate) cpus: AtomicCpuMask,
    /// Bumped by the accountant; pCPUs re-sort when they see it change.
    pub(crate) runq_sort: AtomicU32,
    pub(crate) stats: SchedStats,
}

impl<H: Hypervisor> CreditScheduler<H> {
    /// Build a scheduler over the given hypervisor services. Out-of-range
    /// parameters are reset to their defaults, as on boot.
    pub fn new(hyp: H, params: SchedParams) -> CreditScheduler<H> {
        let scheduler = CreditScheduler {
            hyp,
            params: GlobalParams::new(params),
            prv: Mutex::new(PrivState::default()),
            doms: RwLock::new(BTreeMap::new()),
            vcpus: RwLock::new(BTreeMap::new()),
            pcpus: RwLock::new(BTreeMap::new()),
            idlers: AtomicCpuMask::new(),
            cpus: AtomicCpuMask::new(),
            runq_sort: AtomicU32::new(0),
            stats: SchedStats::default(),
        };
        info!(
            "credit scheduler: tslice {}us, ratelimit {}us",
            scheduler.params.tslice_us(),
            scheduler.params.ratelimit_us()
        );
        scheduler
    }

    pub(crate) fn pcpu(&self, cpu: u32) -> Option<Arc<PcpuState>> {
        self.pcpus.read().get(&cpu).cloned()
    }

    pub(crate) fn sdom(&self, dom: DomainId) -> Option<Arc<Sdom>> {
        self.doms.read().get(&dom).cloned()
    }

    pub(crate) fn svcpu(&self, vcpu: VcpuId) -> Option<Arc<Svcpu>> {
        self.vcpus.read().get(&vcpu).cloned()
    }

    // ------------------------------------------------------------------
    // Domain lifecycle
    // ------------------------------------------------------------------

    /// Register a domain. The idle domain carries no scheduling state.
    pub fn init_domain(&self, dom: DomainId) -> Result<(), SchedError> {
        if dom.is_idle() {
            return Ok(());
        }

        let mut doms = self.doms.write();
        if doms.contains_key(&dom) {
            return Err(SchedError::InvalidParameter);
        }
        doms.insert(dom, Arc::new(Sdom::new(dom)));
        Ok(())
    }

    /// Tear down a domain's scheduling state. Its vCPUs must have been
    /// removed first.
    pub fn destroy_domain(&self, dom: DomainId) -> Result<(), SchedError> {
        if dom.is_idle() {
            return Ok(());
        }

        let sdom = self
            .doms
            .write()
            .remove(&dom)
            .ok_or(SchedError::UnknownDomain)?;
        debug_assert!(sdom.vcpus.lock().is_empty());
        debug_assert_eq!(sdom.active_vcpu_count.load(Ordering::Relaxed), 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // vCPU lifecycle
    // ------------------------------------------------------------------

    /// Allocate scheduling state for a vCPU of `dom`. Idle-domain vCPUs
    /// become the per-pCPU idle placeholders.
    pub fn alloc_vdata(&self, vcpu: VcpuId, dom: DomainId) -> Result<(), SchedError> {
        let sdom = if dom.is_idle() {
            None
        } else {
            Some(self.sdom(dom).ok_or(SchedError::UnknownDomain)?)
        };

        let mut vcpus = self.vcpus.write();
        if vcpus.contains_key(&vcpu) {
            return Err(SchedError::InvalidParameter);
        }

        let svc = Arc::new(Svcpu::new(vcpu, sdom.clone()));
        if let Some(sdom) = sdom {
            sdom.vcpus.lock().push(svc.clone());
        }
        vcpus.insert(vcpu, svc);
        Ok(())
    }

    /// Free a vCPU's scheduling state. It must be off every queue.
    pub fn free_vdata(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self
            .vcpus
            .write()
            .remove(&vcpu)
            .ok_or(SchedError::UnknownVcpu)?;
        debug_assert!(!svc.on_runq.load(Ordering::Relaxed));
        debug_assert!(!svc.active.load(Ordering::Relaxed));

        if let Some(sdom) = svc.sdom.as_ref() {
            let mut dom_vcpus = sdom.vcpus.lock();
            if let Some(pos) = dom_vcpus.iter().position(|v| v.id == vcpu) {
                dom_vcpus.remove(pos);
            }
        }
        Ok(())
    }

    /// Queue a freshly inserted vCPU on its processor if it is ready.
    pub fn insert_vcpu(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;

        if !svc.on_runq.load(Ordering::Relaxed)
            && self.hyp.vcpu_runnable(vcpu)
            && !self.hyp.vcpu_is_running(vcpu)
        {
            let cpu = svc.processor.load(Ordering::Relaxed);
            if let Some(pcpu) = self.pcpu(cpu) {
                let mut state = pcpu.sched.lock();
                pcpu.runq_insert(&mut state, svc);
            }
        }
        Ok(())
    }

    /// Take a vCPU out of scheduling ahead of its removal.
    pub fn remove_vcpu(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;

        if svc.on_runq.load(Ordering::Relaxed) {
            let cpu = svc.processor.load(Ordering::Relaxed);
            if let Some(pcpu) = self.pcpu(cpu) {
                let mut state = pcpu.sched.lock();
                pcpu.runq_remove(&mut state, &svc);
            }
        }

        if svc.active.load(Ordering::Relaxed) {
            if let Some(sdom) = svc.sdom.as_ref() {
                let mut prv = self.prv.lock();
                self.vcpu_acct_stop_locked(&mut prv, sdom, &svc);
            }
        }

        debug_assert!(!svc.on_runq.load(Ordering::Relaxed));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wake, sleep, yield
    // ------------------------------------------------------------------

    pub fn vcpu_sleep(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;
        debug_assert!(!svc.is_idle());

        let cpu = svc.processor.load(Ordering::Relaxed);
        let Some(pcpu) = self.pcpu(cpu) else {
            return Err(SchedError::UnknownPcpu);
        };

        let mut state = pcpu.sched.lock();
        if state.curr.id == vcpu {
            drop(state);
            self.hyp.raise_softirq(CpuMask::single(cpu));
        } else if svc.on_runq.load(Ordering::Relaxed) {
            pcpu.runq_remove(&mut state, &svc);
        }
        Ok(())
    }

    /// Wake a vCPU: boost it if it was UNDER, queue it, and tickle pCPUs
    /// that should come and get it.
    pub fn vcpu_wake(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;
        debug_assert!(!svc.is_idle());

        let cpu = svc.processor.load(Ordering::Relaxed);
        let Some(pcpu) = self.pcpu(cpu) else {
            return Err(SchedError::UnknownPcpu);
        };

        let mut state = pcpu.sched.lock();
        if state.curr.id == vcpu {
            self.stats.vcpu_wake_running.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if svc.on_runq.load(Ordering::Relaxed) {
            self.stats.vcpu_wake_onrunq.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self.hyp.vcpu_runnable(vcpu) {
            self.stats.vcpu_wake_runnable.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats
                .vcpu_wake_not_runnable
                .fetch_add(1, Ordering::Relaxed);
        }

        // Boost wakers that were UNDER: a vCPU that blocks a lot and runs
        // little keeps its boost and wins low wake-to-run latency; one
        // that burns real CPU loses it at the next accounting tick. vCPUs
        // of capped domains unparking after overspending don't get it.
        if svc.band() == Band::Under && !svc.test_flag(VcpuFlags::PARKED) {
            svc.set_band(Band::Boost);
        }

        pcpu.runq_insert(&mut state, svc.clone());
        self.runq_tickle(&pcpu, &state, &svc);
        Ok(())
    }

    pub fn vcpu_yield(&self, vcpu: VcpuId) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;
        if !self.params.default_yield {
            svc.set_flag(VcpuFlags::YIELD);
        }
        Ok(())
    }

    /// Compose the mask of pCPUs worth interrupting for a newly queued
    /// vCPU and raise a reschedule softirq on it.
    fn runq_tickle(&self, pcpu: &PcpuState, state: &PcpuRunState, new: &Arc<Svcpu>) {
        let cur = &state.curr;
        let mut mask = CpuMask::empty();

        // Strictly higher priority than the running vCPU preempts locally.
        if new.band() > cur.band() {
            self.stats.tickle_local.fetch_add(1, Ordering::Relaxed);
            mask.set(pcpu.cpu);
        }

        // If this pCPU already has runnable work, let idlers know there is
        // work in the system.
        if cur.band() > Band::Idle {
            let idlers = self.idlers.load();
            if idlers.is_empty() {
                self.stats.tickle_idlers_none.fetch_add(1, Ordering::Relaxed);
            } else {
                let affinity = self.hyp.cpu_affinity(new.id);
                let idle_mask = idlers.and(affinity);
                if !idle_mask.is_empty() {
                    self.stats.tickle_idlers_some.fetch_add(1, Ordering::Relaxed);
                    if self.params.tickle_one_idle {
                        let last = pcpu.last_tickle.load(Ordering::Relaxed);
                        if let Some(target) = idle_mask.cycle(last) {
                            pcpu.last_tickle.store(target, Ordering::Relaxed);
                            mask.set(target);
                        }
                    } else {
                        mask = mask.or(idle_mask);
                    }
                }
                mask = mask.and(affinity);
            }
        }

        if !mask.is_empty() {
            self.hyp.raise_softirq(mask);
        }
    }

    // ------------------------------------------------------------------
    // Parameter control
    // ------------------------------------------------------------------

    /// Get or set a domain's weight and cap.
    pub fn adjust(&self, dom: DomainId, op: DomainOp) -> Result<DomainSchedInfo, SchedError> {
        let sdom = self.sdom(dom).ok_or(SchedError::UnknownDomain)?;

        // The scheduler lock covers both branches; the pool weight must
        // move in step with an active domain's weight change.
        let mut prv = self.prv.lock();

        if let DomainOp::PutInfo { weight, cap } = op {
            if let Some(weight) = weight {
                if weight == 0 {
                    return Err(SchedError::InvalidParameter);
                }
                if prv.active_sdom.iter().any(|d| Arc::ptr_eq(d, &sdom)) {
                    let active = sdom.active_vcpu_count.load(Ordering::Relaxed) as u32;
                    let old = sdom.weight.load(Ordering::Relaxed) as u32;
                    prv.weight -= old * active;
                    prv.weight += weight as u32 * active;
                }
                sdom.weight.store(weight, Ordering::Relaxed);
            }
            if let Some(cap) = cap {
                sdom.cap.store(cap, Ordering::Relaxed);
            }
        }

        Ok(DomainSchedInfo {
            weight: sdom.weight.load(Ordering::Relaxed),
            cap: sdom.cap.load(Ordering::Relaxed),
        })
    }

    /// Get or set the default time slice and the rate limit.
    pub fn adjust_global(&self, op: GlobalOp) -> Result<GlobalSchedInfo, SchedError> {
        if let GlobalOp::PutInfo {
            tslice_us,
            ratelimit_us,
        } = op
        {
            if !(TSLICE_US_MIN..=TSLICE_US_MAX).contains(&tslice_us)
                || !(RATELIMIT_US_MIN..=RATELIMIT_US_MAX).contains(&ratelimit_us)
                || ratelimit_us > tslice_us
            {
                return Err(SchedError::InvalidParameter);
            }

            self.params.apply_tslice(tslice_us);
            self.params.set_ratelimit_us(ratelimit_us);

            // Re-base the pool credit on the new period length.
            let mut prv = self.prv.lock();
            prv.credit = prv.ncpus * self.params.credits_per_tslice();
        }

        Ok(GlobalSchedInfo {
            tslice_us: self.params.tslice_us(),
            ratelimit_us: self.params.ratelimit_us(),
        })
    }

    /// Age below which a vCPU counts as cache-hot, microseconds.
    pub fn vcpu_migration_delay_us(&self) -> u32 {
        self.params.vcpu_migration_delay_us()
    }

    pub fn set_vcpu_migration_delay_us(&self, us: u32) {
        self.params.set_vcpu_migration_delay_us(us);
    }

    // ------------------------------------------------------------------
    // pCPU lifecycle
    // ------------------------------------------------------------------

    /// Bring a pCPU under this scheduler. The first pCPU to join becomes
    /// the master and hosts the accounting and slice timers.
    pub fn alloc_pdata(&self, cpu: u32) -> Result<(), SchedError> {
        if cpu as usize >= crate::types::MAX_PCPUS {
            return Err(SchedError::CapacityExhausted);
        }

        let idle = self
            .svcpu(self.hyp.idle_vcpu(cpu))
            .ok_or(SchedError::UnknownVcpu)?;
        debug_assert!(idle.is_idle());
        idle.processor.store(cpu, Ordering::Relaxed);

        let mut pcpus = self.pcpus.write();
        if pcpus.contains_key(&cpu) {
            return Err(SchedError::InvalidParameter);
        }

        let now = self.hyp.now();
        let mut prv = self.prv.lock();

        prv.credit += self.params.credits_per_tslice();
        prv.ncpus += 1;
        self.cpus.set(cpu);

        if prv.ncpus == 1 {
            prv.master = Some(cpu);
            self.hyp.init_timer(TimerKind::Master, cpu);
            self.hyp.init_timer(TimerKind::Slice, cpu);
            self.hyp
                .set_timer(TimerKind::Master, cpu, now + us_to_ns(self.params.tslice_us()));
            self.hyp
                .set_timer(TimerKind::Slice, cpu, now + us_to_ns(SLICE_APPLY_PERIOD_US));
            info!("pcpu{cpu} online (master)");
        } else {
            info!("pcpu{cpu} online");
        }

        self.hyp.init_timer(TimerKind::Tick, cpu);
        self.hyp
            .set_timer(TimerKind::Tick, cpu, now + us_to_ns(self.params.tick_period_us()));
        self.hyp.init_timer(TimerKind::Metric, cpu);
        self.hyp
            .set_timer(TimerKind::Metric, cpu, now + us_to_ns(METRIC_TICK_PERIOD_US));

        let pcpu = Arc::new(PcpuState::new(
            cpu,
            idle,
            self.runq_sort.load(Ordering::Acquire),
        ));
        pcpus.insert(cpu, pcpu);

        // A pCPU starts off idling.
        self.idlers.set(cpu);
        Ok(())
    }

    /// Take a pCPU out of this scheduler; the master role moves to a
    /// surviving pCPU.
    pub fn free_pdata(&self, cpu: u32) -> Result<(), SchedError> {
        let pcpu = self
            .pcpus
            .write()
            .remove(&cpu)
            .ok_or(SchedError::UnknownPcpu)?;
        debug_assert!(pcpu.sched.lock().runq.is_empty());

        let mut prv = self.prv.lock();

        prv.credit = prv.credit.saturating_sub(self.params.credits_per_tslice());
        prv.ncpus -= 1;
        self.idlers.clear(cpu);
        self.cpus.clear(cpu);

        if prv.master == Some(cpu) && prv.ncpus > 0 {
            let new_master = self.cpus.load().first();
            prv.master = new_master;
            if let Some(new_master) = new_master {
                self.hyp.migrate_timer(TimerKind::Master, new_master);
                self.hyp.migrate_timer(TimerKind::Slice, new_master);
                info!("master moved from pcpu{cpu} to pcpu{new_master}");
            }
        }

        self.hyp.kill_timer(TimerKind::Tick, cpu);
        self.hyp.kill_timer(TimerKind::Metric, cpu);
        if prv.ncpus == 0 {
            if let Some(master) = prv.master.take() {
                self.hyp.kill_timer(TimerKind::Master, master);
                self.hyp.kill_timer(TimerKind::Slice, master);
            }
        }

        info!("pcpu{cpu} offline");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Placement and dispatch
    // ------------------------------------------------------------------

    /// Choose and commit a pCPU for a vCPU.
    pub fn pick_cpu(&self, vcpu: VcpuId) -> Result<u32, SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;
        Ok(self.pick_cpu_internal(&svc, true))
    }

    /// Commit a placement: assign a dequeued, non-running vCPU to a pCPU.
    /// Normally follows [`pick_cpu`](Self::pick_cpu).
    pub fn set_processor(&self, vcpu: VcpuId, cpu: u32) -> Result<(), SchedError> {
        let svc = self.svcpu(vcpu).ok_or(SchedError::UnknownVcpu)?;
        self.pcpu(cpu).ok_or(SchedError::UnknownPcpu)?;
        debug_assert!(!svc.on_runq.load(Ordering::Relaxed));
        svc.processor.store(cpu, Ordering::Relaxed);
        Ok(())
    }

    /// The dispatch decision for `cpu`: pick the next vCPU, stealing from
    /// peers when the local best is out of credit, and return the slice it
    /// may run for.
    pub fn do_schedule(
        &self,
        cpu: u32,
        now: u64,
        tasklet_work_scheduled: bool,
    ) -> Result<TaskSlice, SchedError> {
        let pcpu = self.pcpu(cpu).ok_or(SchedError::UnknownPcpu)?;
        let mut state = pcpu.sched.lock();

        self.stats.schedule.fetch_add(1, Ordering::Relaxed);

        let scurr = state.curr.clone();
        let runtime = now.saturating_sub(state.run_start);

        if !scurr.is_idle() {
            // Settle the outgoing vCPU's credits; the -now offset makes the
            // next burn measure from its next dispatch.
            scurr.burn_credits(now);
            scurr.start_time.fetch_sub(now as i64, Ordering::Relaxed);
        } else {
            // Re-instate a tasklet-boosted idle vCPU as plain idle.
            scurr.set_band(Band::Idle);
        }

        // Rate limiting: a vCPU that has only just started running keeps
        // the pCPU for a short fixed slice.
        let ratelimit_us = self.params.ratelimit_us();
        if !tasklet_work_scheduled
            && ratelimit_us != 0
            && !scurr.is_idle()
            && self.hyp.vcpu_runnable(scurr.id)
            && runtime < us_to_ns(ratelimit_us)
        {
            scurr.start_time.fetch_add(now as i64, Ordering::Relaxed);
            return Ok(TaskSlice {
                task: scurr.id,
                time: Some(us_to_ns(ratelimit_us)),
                migrated: false,
            });
        }

        // Put the outgoing vCPU back in line if it still wants the CPU.
        if self.hyp.vcpu_runnable(scurr.id) {
            pcpu.runq_insert(&mut state, scurr.clone());
        } else {
            debug_assert!(!scurr.is_idle() && !state.runq.is_empty());
        }

        let mut snext = state.runq.head().cloned().ok_or(SchedError::UnknownVcpu)?;
        let mut migrated = false;

        // Tasklet work runs in idle vCPU context and overrides all else.
        if tasklet_work_scheduled {
            snext = state.idle.clone();
            snext.set_band(Band::Boost);
        }

        if scurr.test_flag(VcpuFlags::YIELD) {
            scurr.clear_flag(VcpuFlags::YIELD);
        }

        // If the best local candidate has eaten through its credits, see
        // whether a peer queues something more urgent.
        if snext.band() > Band::Over {
            pcpu.runq_remove(&mut state, &snext);
        } else {
            snext = self.load_balance(cpu, &pcpu, &mut state, snext, now, &mut migrated);
        }

        // While idling we advertise ourselves so busy pCPUs tickle us.
        if snext.band() == Band::Idle {
            self.idlers.set(cpu);
        } else {
            self.idlers.clear(cpu);
        }

        if !snext.is_idle() {
            snext.start_time.fetch_add(now as i64, Ordering::Relaxed);
        }

        if snext.id != scurr.id {
            scurr.last_run.store(now, Ordering::Relaxed);
            debug!("pcpu{cpu}: {} -> {}", scurr.id, snext.id);
        }

        let time = snext
            .sdom
            .as_ref()
            .map(|sdom| us_to_ns(sdom.tslice_us()));

        state.curr = snext.clone();
        state.run_start = now;

        Ok(TaskSlice {
            task: snext.id,
            time,
            migrated,
        })
    }
}
