//! Mock hypervisor platform for scheduler tests
//!
//! Implements the `Hypervisor` upcalls over a virtual clock, a scripted
//! topology, scripted vCPU states and scripted PMC streams, and records
//! every pause/unpause/softirq/timer call so tests can assert on them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use credit_sched::{
    CpuMask, CreditScheduler, DomainId, Hypervisor, SchedParams, TimerKind, VcpuId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum PauseEvent {
    Pause(VcpuId),
    Unpause(VcpuId),
}

#[derive(Default)]
struct Inner {
    now: u64,
    online: CpuMask,
    idle_vcpus: HashMap<u32, VcpuId>,
    sibling: HashMap<u32, CpuMask>,
    core: HashMap<u32, CpuMask>,
    not_runnable: HashSet<VcpuId>,
    running: HashSet<VcpuId>,
    affinity: HashMap<VcpuId, CpuMask>,
    pmc: HashMap<VcpuId, [u64; 4]>,
    pending_requests: HashMap<DomainId, u64>,
    pause_events: Vec<PauseEvent>,
    softirqs: Vec<CpuMask>,
    timers_set: Vec<(TimerKind, u32, u64)>,
    timers_killed: Vec<(TimerKind, u32)>,
    timers_stopped: Vec<(TimerKind, u32)>,
    timers_migrated: Vec<(TimerKind, u32)>,
    pmu_flushes: Vec<VcpuId>,
}

/// Shared-handle mock: clone it before handing it to the scheduler to
/// keep scripting and asserting from the test body.
#[derive(Clone, Default)]
pub struct MockHypervisor {
    inner: Arc<Mutex<Inner>>,
}

#[allow(dead_code)]
impl MockHypervisor {
    pub fn new() -> MockHypervisor {
        MockHypervisor::default()
    }

    pub fn set_online(&self, mask: CpuMask) {
        self.inner.lock().unwrap().online = mask;
    }

    pub fn set_idle_vcpu(&self, cpu: u32, vcpu: VcpuId) {
        self.inner.lock().unwrap().idle_vcpus.insert(cpu, vcpu);
    }

    pub fn set_topology(&self, cpu: u32, sibling: CpuMask, core: CpuMask) {
        let mut inner = self.inner.lock().unwrap();
        inner.sibling.insert(cpu, sibling);
        inner.core.insert(cpu, core);
    }

    pub fn advance(&self, ns: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.now += ns;
        inner.now
    }

    pub fn now_ns(&self) -> u64 {
        self.inner.lock().unwrap().now
    }

    pub fn set_runnable(&self, vcpu: VcpuId, runnable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if runnable {
            inner.not_runnable.remove(&vcpu);
        } else {
            inner.not_runnable.insert(vcpu);
        }
    }

    pub fn set_running(&self, vcpu: VcpuId, running: bool) {
        let mut inner = self.inner.lock().unwrap();
        if running {
            inner.running.insert(vcpu);
        } else {
            inner.running.remove(&vcpu);
        }
    }

    pub fn set_affinity(&self, vcpu: VcpuId, mask: CpuMask) {
        self.inner.lock().unwrap().affinity.insert(vcpu, mask);
    }

    /// Advance a vCPU's cumulative PMC mirror by one interval's worth.
    pub fn add_pmc(&self, vcpu: VcpuId, delta: [u64; 4]) {
        let mut inner = self.inner.lock().unwrap();
        let pmc = inner.pmc.entry(vcpu).or_insert([0; 4]);
        for i in 0..4 {
            pmc[i] += delta[i];
        }
    }

    pub fn set_pending_requests(&self, dom: DomainId, count: u64) {
        self.inner.lock().unwrap().pending_requests.insert(dom, count);
    }

    pub fn take_pause_events(&self) -> Vec<PauseEvent> {
        std::mem::take(&mut self.inner.lock().unwrap().pause_events)
    }

    pub fn take_softirqs(&self) -> Vec<CpuMask> {
        std::mem::take(&mut self.inner.lock().unwrap().softirqs)
    }

    pub fn take_timers_set(&self) -> Vec<(TimerKind, u32, u64)> {
        std::mem::take(&mut self.inner.lock().unwrap().timers_set)
    }

    pub fn timers_migrated(&self) -> Vec<(TimerKind, u32)> {
        self.inner.lock().unwrap().timers_migrated.clone()
    }

    pub fn timers_killed(&self) -> Vec<(TimerKind, u32)> {
        self.inner.lock().unwrap().timers_killed.clone()
    }

    pub fn timers_stopped(&self) -> Vec<(TimerKind, u32)> {
        self.inner.lock().unwrap().timers_stopped.clone()
    }
}

impl Hypervisor for MockHypervisor {
    fn now(&self) -> u64 {
        self.inner.lock().unwrap().now
    }

    fn idle_vcpu(&self, cpu: u32) -> VcpuId {
        *self
            .inner
            .lock()
            .unwrap()
            .idle_vcpus
            .get(&cpu)
            .unwrap_or(&VcpuId(u32::MAX))
    }

    fn vcpu_runnable(&self, vcpu: VcpuId) -> bool {
        !self.inner.lock().unwrap().not_runnable.contains(&vcpu)
    }

    fn vcpu_is_running(&self, vcpu: VcpuId) -> bool {
        self.inner.lock().unwrap().running.contains(&vcpu)
    }

    fn vcpu_pause_nosync(&self, vcpu: VcpuId) {
        self.inner
            .lock()
            .unwrap()
            .pause_events
            .push(PauseEvent::Pause(vcpu));
    }

    fn vcpu_unpause(&self, vcpu: VcpuId) {
        self.inner
            .lock()
            .unwrap()
            .pause_events
            .push(PauseEvent::Unpause(vcpu));
    }

    fn cpu_affinity(&self, vcpu: VcpuId) -> CpuMask {
        *self
            .inner
            .lock()
            .unwrap()
            .affinity
            .get(&vcpu)
            .unwrap_or(&CpuMask::all())
    }

    fn online_mask(&self) -> CpuMask {
        self.inner.lock().unwrap().online
    }

    fn sibling_mask(&self, cpu: u32) -> CpuMask {
        *self
            .inner
            .lock()
            .unwrap()
            .sibling
            .get(&cpu)
            .unwrap_or(&CpuMask::single(cpu))
    }

    fn core_mask(&self, cpu: u32) -> CpuMask {
        let inner = self.inner.lock().unwrap();
        *inner.core.get(&cpu).unwrap_or(&inner.online)
    }

    fn raise_softirq(&self, mask: CpuMask) {
        self.inner.lock().unwrap().softirqs.push(mask);
    }

    fn vcpu_pmc(&self, vcpu: VcpuId) -> [u64; 4] {
        *self.inner.lock().unwrap().pmc.get(&vcpu).unwrap_or(&[0; 4])
    }

    fn pmu_save_regs(&self, vcpu: VcpuId) {
        self.inner.lock().unwrap().pmu_flushes.push(vcpu);
    }

    fn pmu_restore_regs(&self, _vcpu: VcpuId) {}

    fn take_pending_requests(&self, dom: DomainId) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .pending_requests
            .remove(&dom)
            .unwrap_or(0)
    }

    fn init_timer(&self, _kind: TimerKind, _cpu: u32) {}

    fn set_timer(&self, kind: TimerKind, cpu: u32, deadline_ns: u64) {
        self.inner
            .lock()
            .unwrap()
            .timers_set
            .push((kind, cpu, deadline_ns));
    }

    fn stop_timer(&self, kind: TimerKind, cpu: u32) {
        self.inner.lock().unwrap().timers_stopped.push((kind, cpu));
    }

    fn kill_timer(&self, kind: TimerKind, cpu: u32) {
        self.inner.lock().unwrap().timers_killed.push((kind, cpu));
    }

    fn migrate_timer(&self, kind: TimerKind, cpu: u32) {
        self.inner.lock().unwrap().timers_migrated.push((kind, cpu));
    }
}

/// Idle vCPU ids start here; guest vCPU ids in tests stay below.
#[allow(dead_code)]
pub const IDLE_BASE: u32 = 1000;

/// Bring up a scheduler over `ncpus` pCPUs with idle vCPUs registered.
#[allow(dead_code)]
pub fn setup(
    ncpus: u32,
    params: SchedParams,
) -> (MockHypervisor, CreditScheduler<MockHypervisor>) {
    let hyp = MockHypervisor::new();
    let mut online = CpuMask::empty();
    for cpu in 0..ncpus {
        online.set(cpu);
    }
    hyp.set_online(online);

    let sched = CreditScheduler::new(hyp.clone(), params);
    for cpu in 0..ncpus {
        let idle = VcpuId(IDLE_BASE + cpu);
        hyp.set_idle_vcpu(cpu, idle);
        sched.alloc_vdata(idle, DomainId::IDLE).unwrap();
        sched.alloc_pdata(cpu).unwrap();
    }
    (hyp, sched)
}

/// Parameters most tests want: rate limiting off so dispatch decisions
/// are driven purely by bands and credits.
#[allow(dead_code)]
pub fn test_params() -> SchedParams {
    SchedParams {
        ratelimit_us: 0,
        ..SchedParams::default()
    }
}

/// Register a guest domain with one entry per (vcpu, pcpu) placement.
#[allow(dead_code)]
pub fn add_domain(
    sched: &CreditScheduler<MockHypervisor>,
    dom: DomainId,
    vcpus: &[(VcpuId, u32)],
) {
    sched.init_domain(dom).unwrap();
    for &(vcpu, cpu) in vcpus {
        sched.alloc_vdata(vcpu, dom).unwrap();
        sched.set_processor(vcpu, cpu).unwrap();
    }
}
