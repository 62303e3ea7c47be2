//! Per-pCPU state and the accounting tick
//!
//! Each online pCPU owns a schedule lock covering its runqueue and the
//! currently-dispatched vCPU, plus lock-free cursors (tick count, sort
//! epoch, idle bias, tickle cursor) and a runnable counter read by load
//! probes without the lock.

use alloc::sync::Arc;

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::core::CreditScheduler;
use crate::runq::RunQueue;
use crate::types::{us_to_ns, Band, CpuMask, MAX_PCPUS};
use crate::upcalls::{Hypervisor, TimerKind};
use crate::vcpu::Svcpu;

/// Runqueue and dispatch state guarded by the pCPU schedule lock.
#[derive(Debug)]
pub(crate) struct PcpuRunState {
    pub runq: RunQueue,
    /// The vCPU this pCPU is executing.
    pub curr: Arc<Svcpu>,
    /// The pCPU's idle placeholder vCPU.
    pub idle: Arc<Svcpu>,
    /// When `curr` was dispatched; basis for the rate limiter.
    pub run_start: u64,
}

#[derive(Debug)]
pub(crate) struct PcpuState {
    pub cpu: u32,
    pub sched: Mutex<PcpuRunState>,
    pub tick: AtomicU32,
    /// Last runqueue-sort epoch this pCPU acted on.
    pub runq_sort_last: AtomicU32,
    /// Cursor distributing picked idle CPUs across a sibling group.
    pub idle_bias: AtomicU32,
    /// Cursor distributing idle tickles round-robin.
    pub last_tickle: AtomicU32,
    /// Runnable vCPUs queued here; readable without the schedule lock.
    pub runnable: AtomicU32,
}

impl PcpuState {
    pub fn new(cpu: u32, idle: Arc<Svcpu>, sort_epoch: u32) -> PcpuState {
        PcpuState {
            cpu,
            sched: Mutex::new(PcpuRunState {
                runq: RunQueue::new(),
                curr: idle.clone(),
                idle,
                run_start: 0,
            }),
            tick: AtomicU32::new(0),
            runq_sort_last: AtomicU32::new(sort_epoch),
            idle_bias: AtomicU32::new(MAX_PCPUS as u32 - 1),
            last_tickle: AtomicU32::new(0),
            runnable: AtomicU32::new(0),
        }
    }

    pub fn runq_insert(&self, state: &mut PcpuRunState, svc: Arc<Svcpu>) {
        state.runq.insert(svc);
        self.runnable.store(state.runq.len() as u32, Ordering::Relaxed);
    }

    pub fn runq_remove(&self, state: &mut PcpuRunState, svc: &Svcpu) -> bool {
        let removed = state.runq.remove(svc);
        self.runnable.store(state.runq.len() as u32, Ordering::Relaxed);
        removed
    }
}

impl<H: Hypervisor> CreditScheduler<H> {
    /// Per-pCPU periodic tick: burn the running vCPU's credits, keep the
    /// accounting membership current, pick up pending runqueue sorts and
    /// re-arm at the running domain's tick period.
    pub fn tick(&self, cpu: u32) {
        let Some(pcpu) = self.pcpu(cpu) else {
            return;
        };

        pcpu.tick.fetch_add(1, Ordering::Relaxed);

        let curr = pcpu.sched.lock().curr.clone();
        let mut dom_period = None;

        if !curr.is_idle() {
            self.vcpu_acct(&curr, cpu);
            dom_period = curr.sdom.as_ref().map(|d| d.tick_period_us());
        }

        // In long-slice mode the hardware counters are flushed into the
        // per-vCPU mirrors here; otherwise the metric tick does it.
        if self.params.tslice_us() > 1111 {
            self.hyp.pmu_save_regs(curr.id);
            self.hyp.pmu_restore_regs(curr.id);
        }

        self.runq_sort_check(&pcpu);

        let period = dom_period.unwrap_or_else(|| self.params.tick_period_us());
        let now = self.hyp.now();
        self.hyp.set_timer(TimerKind::Tick, cpu, now + us_to_ns(period));
    }

    /// Tick-time accounting for the running vCPU.
    fn vcpu_acct(&self, svc: &Arc<Svcpu>, cpu: u32) {
        debug_assert_eq!(svc.processor.load(Ordering::Relaxed), cpu);
        debug_assert!(svc.sdom.is_some());

        // A boosted vCPU found running at tick time is consuming real CPU
        // and no longer deserves its wake-up boost.
        if svc.band() == Band::Boost {
            svc.set_band(Band::Under);
        }

        svc.burn_credits(self.hyp.now());

        if !svc.active.load(Ordering::Relaxed) {
            self.vcpu_acct_start(svc);
        } else if self.pick_cpu_internal(svc, false) != cpu {
            svc.stats.migrate_r.fetch_add(1, Ordering::Relaxed);
            self.stats.migrate_running.fetch_add(1, Ordering::Relaxed);
            self.hyp.vcpu_mark_migrating(svc.id);
            self.hyp.raise_softirq(CpuMask::single(cpu));
        }
    }

    /// Re-sort the runqueue if the master bumped the sort epoch since this
    /// pCPU last looked. Runs at most once per accounting period.
    fn runq_sort_check(&self, pcpu: &PcpuState) {
        let epoch = self.runq_sort.load(Ordering::Acquire);
        if epoch == pcpu.runq_sort_last.load(Ordering::Relaxed) {
            return;
        }
        pcpu.runq_sort_last.store(epoch, Ordering::Relaxed);

        pcpu.sched.lock().runq.resort();
    }

    /// Pause the per-pCPU timers across a power event.
    pub fn tick_suspend(&self, cpu: u32) {
        self.hyp.stop_timer(TimerKind::Tick, cpu);
        self.hyp.stop_timer(TimerKind::Metric, cpu);
    }

    /// Restart the per-pCPU timers, phase-aligned to their periods.
    pub fn tick_resume(&self, cpu: u32) {
        let now = self.hyp.now();
        let tick_period = us_to_ns(self.params.tick_period_us());
        let metric_period = us_to_ns(crate::types::METRIC_TICK_PERIOD_US);

        self.hyp
            .set_timer(TimerKind::Tick, cpu, now + tick_period - now % tick_period);
        self.hyp.set_timer(
            TimerKind::Metric,
            cpu,
            now + metric_period - now % metric_period,
        );
    }
}
