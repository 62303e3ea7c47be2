//! Scheduler counters and diagnostic dumps
//!
//! Counters are relaxed atomics bumped from the hot paths; the dump
//! functions write through `core::fmt::Write` so the embedder decides
//! where diagnostics go (console, ring buffer, debugfs analogue).

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::core::CreditScheduler;
use crate::types::{Band, DEFAULT_WEIGHT, CREDITS_PER_MSEC};
use crate::upcalls::Hypervisor;
use crate::vcpu::Svcpu;

#[derive(Debug, Default)]
pub(crate) struct SchedStats {
    pub schedule: AtomicU64,
    pub acct_run: AtomicU64,
    pub acct_balance: AtomicU64,
    pub acct_no_work: AtomicU64,
    pub acct_min_credit: AtomicU64,
    pub acct_reorder: AtomicU64,
    pub vcpu_park: AtomicU64,
    pub vcpu_unpark: AtomicU64,
    pub vcpu_wake_running: AtomicU64,
    pub vcpu_wake_onrunq: AtomicU64,
    pub vcpu_wake_runnable: AtomicU64,
    pub vcpu_wake_not_runnable: AtomicU64,
    pub tickle_local: AtomicU64,
    pub tickle_idlers_none: AtomicU64,
    pub tickle_idlers_some: AtomicU64,
    pub steal_trylock_failed: AtomicU64,
    pub migrate_queued: AtomicU64,
    pub migrate_running: AtomicU64,
    pub load_balance_idle: AtomicU64,
    pub load_balance_over: AtomicU64,
    pub load_balance_other: AtomicU64,
    pub vcpu_hot: AtomicU64,
}

/// Snapshot of the scheduler-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedCounters {
    pub schedule: u64,
    pub acct_run: u64,
    pub vcpu_park: u64,
    pub vcpu_unpark: u64,
    pub migrate_queued: u64,
    pub migrate_running: u64,
    pub steal_trylock_failed: u64,
    pub tickle_local: u64,
    pub tickle_idlers_some: u64,
}

fn band_str(band: Band) -> &'static str {
    match band {
        Band::Boost => "BOOST",
        Band::Under => "UNDER",
        Band::Over => "OVER",
        Band::Idle => "IDLE",
    }
}

impl<H: Hypervisor> CreditScheduler<H> {
    /// Snapshot the scheduler-wide counters.
    pub fn counters(&self) -> SchedCounters {
        SchedCounters {
            schedule: self.stats.schedule.load(Ordering::Relaxed),
            acct_run: self.stats.acct_run.load(Ordering::Relaxed),
            vcpu_park: self.stats.vcpu_park.load(Ordering::Relaxed),
            vcpu_unpark: self.stats.vcpu_unpark.load(Ordering::Relaxed),
            migrate_queued: self.stats.migrate_queued.load(Ordering::Relaxed),
            migrate_running: self.stats.migrate_running.load(Ordering::Relaxed),
            steal_trylock_failed: self.stats.steal_trylock_failed.load(Ordering::Relaxed),
            tickle_local: self.stats.tickle_local.load(Ordering::Relaxed),
            tickle_idlers_some: self.stats.tickle_idlers_some.load(Ordering::Relaxed),
        }
    }

    /// Current priority band of a vCPU.
    pub fn vcpu_band(&self, vcpu: crate::types::VcpuId) -> Option<Band> {
        self.svcpu(vcpu).map(|svc| svc.band())
    }

    /// Current credit of a vCPU.
    pub fn vcpu_credit(&self, vcpu: crate::types::VcpuId) -> Option<i32> {
        self.svcpu(vcpu)
            .map(|svc| svc.credit.load(Ordering::Relaxed))
    }

    fn dump_vcpu(&self, w: &mut dyn Write, svc: &Svcpu) -> fmt::Result {
        write!(
            w,
            "[{}] pri={} flags={:#x} cpu={}",
            svc.id,
            band_str(svc.band()),
            svc.flags().bits(),
            svc.processor.load(Ordering::Relaxed),
        )?;
        if let Some(sdom) = svc.sdom.as_ref() {
            write!(
                w,
                " credit={} [w={}] ({}+{}) {{a/i={}/{} m={}+{}}}",
                svc.credit.load(Ordering::Relaxed),
                sdom.weight.load(Ordering::Relaxed),
                svc.stats.credit_last.load(Ordering::Relaxed),
                svc.stats.credit_incr.load(Ordering::Relaxed),
                svc.stats.state_active.load(Ordering::Relaxed),
                svc.stats.state_idle.load(Ordering::Relaxed),
                svc.stats.migrate_q.load(Ordering::Relaxed),
                svc.stats.migrate_r.load(Ordering::Relaxed),
            )?;
        }
        writeln!(w)
    }

    /// Dump the global configuration and the active-vCPU walk.
    pub fn dump_settings(&self, w: &mut dyn Write) -> fmt::Result {
        let prv = self.prv.lock();

        writeln!(w, "info:")?;
        writeln!(w, "\tncpus              = {}", prv.ncpus)?;
        match prv.master {
            Some(master) => writeln!(w, "\tmaster             = {master}")?,
            None => writeln!(w, "\tmaster             = none")?,
        }
        writeln!(w, "\tcredit             = {}", prv.credit)?;
        writeln!(w, "\tcredit balance     = {}", prv.credit_balance)?;
        writeln!(w, "\tweight             = {}", prv.weight)?;
        writeln!(
            w,
            "\trunq_sort          = {}",
            self.runq_sort.load(Ordering::Relaxed)
        )?;
        writeln!(w, "\tdefault-weight     = {DEFAULT_WEIGHT}")?;
        writeln!(w, "\ttslice             = {}us", self.params.tslice_us())?;
        writeln!(w, "\tratelimit          = {}us", self.params.ratelimit_us())?;
        writeln!(w, "\tcredits per msec   = {CREDITS_PER_MSEC}")?;
        writeln!(
            w,
            "\tticks per tslice   = {}",
            self.params.ticks_per_tslice()
        )?;
        writeln!(
            w,
            "\tmigration delay    = {}us",
            self.params.vcpu_migration_delay_us()
        )?;
        writeln!(w, "idlers: {}", self.idlers.load())?;

        writeln!(w, "active vcpus:")?;
        let mut loop_count = 0;
        for sdom in prv.active_sdom.iter() {
            for svc in sdom.active_vcpu.lock().iter() {
                loop_count += 1;
                write!(w, "\t{loop_count:3}: ")?;
                self.dump_vcpu(w, svc)?;
            }
        }
        Ok(())
    }

    /// Dump one pCPU's runqueue.
    pub fn dump_cpu_state(&self, w: &mut dyn Write, cpu: u32) -> fmt::Result {
        let Some(pcpu) = self.pcpu(cpu) else {
            return writeln!(w, "pcpu{cpu}: offline");
        };

        writeln!(
            w,
            "sort={}, sibling={}, core={}",
            pcpu.runq_sort_last.load(Ordering::Relaxed),
            self.hyp.sibling_mask(cpu),
            self.hyp.core_mask(cpu),
        )?;

        let state = pcpu.sched.lock();
        write!(w, "\trun: ")?;
        self.dump_vcpu(w, &state.curr)?;

        for (i, svc) in state.runq.iter().enumerate() {
            write!(w, "\t{:3}: ", i + 1)?;
            self.dump_vcpu(w, svc)?;
        }
        Ok(())
    }

    /// Dump per-domain PMC mirrors and controller outputs.
    pub fn dump_admin_conf(&self, w: &mut dyn Write) -> fmt::Result {
        writeln!(w, "cpus: {}", self.cpus.load())?;

        for (dom, sdom) in self.doms.read().iter() {
            let metrics = sdom.metrics.lock();
            writeln!(
                w,
                "{}: slice={}us phase={:?} miss_rate={} cpi={} pending={}",
                dom,
                sdom.tslice_us(),
                metrics.phase,
                sdom.cache_miss_rate.load(Ordering::Relaxed),
                sdom.cpi.load(Ordering::Relaxed),
                sdom.pending_requests.load(Ordering::Relaxed),
            )?;
            writeln!(
                w,
                "    pmuinfo: INST_RETIRED={} CPU_CLK_UNHALTED={} LLC_REFERENCES={} LLC_MISSES={}",
                metrics.pmc[0], metrics.pmc[1], metrics.pmc[2], metrics.pmc[3],
            )?;
            drop(metrics);

            for svc in sdom.vcpus.lock().iter() {
                let pmc = self.hyp.vcpu_pmc(svc.id);
                writeln!(
                    w,
                    "    {}: pmc=[{} {} {} {}] credit={}",
                    svc.id,
                    pmc[0],
                    pmc[1],
                    pmc[2],
                    pmc[3],
                    svc.credit.load(Ordering::Relaxed),
                )?;
            }
        }
        Ok(())
    }
}
