//! CPU picking and work stealing
//!
//! Placement prefers idle execution vehicles with the most idling
//! neighbours so work spreads across cores and sockets before doubling up
//! on hyperthreads. Stealing walks busy peers with a try-lock only, so two
//! pCPUs balancing against each other can never deadlock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::Ordering;

use log::debug;

use crate::core::CreditScheduler;
use crate::pcpu::{PcpuRunState, PcpuState};
use crate::types::Band;
use crate::upcalls::Hypervisor;
use crate::vcpu::Svcpu;

impl<H: Hypervisor> CreditScheduler<H> {
    /// Pick a pCPU for a vCPU, honouring affinity and preferring its
    /// current processor. `commit` records the choice in the target
    /// sibling group's idle-bias cursor.
    pub(crate) fn pick_cpu_internal(&self, svc: &Arc<Svcpu>, commit: bool) -> u32 {
        let online = self.hyp.online_mask();
        let mut cpus = online.and(self.hyp.cpu_affinity(svc.id));

        let current = svc.processor.load(Ordering::Relaxed);
        let mut cpu = if cpus.test(current) {
            current
        } else {
            cpus.cycle(current).unwrap_or(current)
        };

        // Among the idle candidates, prefer the one whose neighbourhood
        // idles the most: same-socket contests compare sibling threads,
        // cross-socket contests compare whole cores and require the other
        // side to be twice as idle.
        let mut idlers = self.idlers.load().and(online);
        idlers.set(cpu);
        cpus = cpus.and(idlers);
        cpus.clear(cpu);

        let mut bias_owner = None;

        while !cpus.is_empty() {
            let Some(nxt) = cpus.cycle(cpu) else {
                break;
            };

            let same_socket = self.hyp.core_mask(nxt).test(cpu);
            let (migrate_factor, cpu_idlers, nxt_idlers) = if same_socket {
                (
                    1,
                    idlers.and(self.hyp.sibling_mask(cpu)),
                    idlers.and(self.hyp.sibling_mask(nxt)),
                )
            } else {
                (
                    2,
                    idlers.and(self.hyp.core_mask(cpu)),
                    idlers.and(self.hyp.core_mask(nxt)),
                )
            };

            let weight_cpu = cpu_idlers.weight();
            let weight_nxt = nxt_idlers.weight();

            let migrate = if self.params.smt_power_savings {
                // Power saving: consolidate work rather than spreading it.
                weight_cpu > weight_nxt
            } else {
                weight_cpu * migrate_factor < weight_nxt
            };

            if migrate {
                let candidates = cpus.and(nxt_idlers);
                let bias = self
                    .pcpu(nxt)
                    .map(|p| p.idle_bias.load(Ordering::Relaxed))
                    .unwrap_or(0);
                cpu = candidates.cycle(bias).unwrap_or(nxt);
                bias_owner = Some(nxt);
                cpus = cpus.andnot(self.hyp.sibling_mask(cpu));
            } else {
                cpus = cpus.andnot(nxt_idlers);
            }
        }

        if commit {
            if let Some(owner) = bias_owner {
                if let Some(pcpu) = self.pcpu(owner) {
                    pcpu.idle_bias.store(cpu, Ordering::Relaxed);
                }
            }
        }

        cpu
    }

    fn vcpu_is_cache_hot(&self, svc: &Svcpu, now: u64) -> bool {
        let delay = self.params.vcpu_migration_delay_us() as u64 * 1000;
        let hot = now.saturating_sub(svc.last_run.load(Ordering::Relaxed)) < delay;
        if hot {
            self.stats.vcpu_hot.fetch_add(1, Ordering::Relaxed);
        }
        hot
    }

    /// Don't pick up work that is still in the peer's scheduling tail or
    /// hot in its cache, and only work this pCPU is allowed to run.
    fn vcpu_is_migrateable(&self, svc: &Svcpu, dest_cpu: u32, now: u64) -> bool {
        !self.hyp.vcpu_is_running(svc.id)
            && !self.vcpu_is_cache_hot(svc, now)
            && self.hyp.cpu_affinity(svc.id).test(dest_cpu)
    }

    /// Steal the first vCPU on a peer's runqueue of strictly higher band
    /// than our local candidate. Ownership transfers by reassigning the
    /// processor field; the caller relinks it on its own side.
    fn runq_steal(
        &self,
        peer: &PcpuState,
        peer_state: &mut PcpuRunState,
        cpu: u32,
        band: Band,
        now: u64,
    ) -> Option<Arc<Svcpu>> {
        let candidates: Vec<Arc<Svcpu>> = peer_state.runq.iter().cloned().collect();
        for speer in candidates {
            // The queue is band-ordered: past the first not-better entry
            // this peer has nothing for us.
            if speer.band() <= band {
                break;
            }

            debug_assert!(!speer.is_idle());

            if self.vcpu_is_migrateable(&speer, cpu, now) {
                speer.stats.migrate_q.fetch_add(1, Ordering::Relaxed);
                self.stats.migrate_queued.fetch_add(1, Ordering::Relaxed);
                peer.runq_remove(peer_state, &speer);
                speer.processor.store(cpu, Ordering::Relaxed);
                debug!("stole {} from pcpu{} to pcpu{}", speer.id, peer.cpu, cpu);
                return Some(speer);
            }
        }

        None
    }

    /// Look for more urgent work on other pCPUs' runqueues. Returns a
    /// stolen vCPU, or `snext` popped from the local runqueue when no peer
    /// has anything better.
    pub(crate) fn load_balance(
        &self,
        cpu: u32,
        pcpu: &PcpuState,
        state: &mut PcpuRunState,
        snext: Arc<Svcpu>,
        now: u64,
        migrated: &mut bool,
    ) -> Arc<Svcpu> {
        debug_assert_eq!(snext.processor.load(Ordering::Relaxed), cpu);

        let online = self.hyp.online_mask();

        // A pCPU on its way offline shouldn't pull work towards itself.
        if online.test(cpu) {
            match snext.band() {
                Band::Idle => self.stats.load_balance_idle.fetch_add(1, Ordering::Relaxed),
                Band::Over => self.stats.load_balance_over.fetch_add(1, Ordering::Relaxed),
                _ => self.stats.load_balance_other.fetch_add(1, Ordering::Relaxed),
            };

            // Peek at the non-idling pCPUs, starting with our neighbour.
            let mut workers = online.andnot(self.idlers.load());
            workers.clear(cpu);

            let mut peer_cpu = cpu;
            while !workers.is_empty() {
                let Some(next_peer) = workers.cycle(peer_cpu) else {
                    break;
                };
                peer_cpu = next_peer;
                workers.clear(peer_cpu);

                let Some(peer) = self.pcpu(peer_cpu) else {
                    continue;
                };

                // Try-lock only: spinning here could deadlock against a
                // peer balancing in the opposite direction.
                let Some(mut peer_state) = peer.sched.try_lock() else {
                    self.stats
                        .steal_trylock_failed
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                };

                // An idle peer is about to pick its queue up itself.
                let speer = if !peer_state.curr.is_idle() && online.test(peer_cpu) {
                    self.runq_steal(&peer, &mut peer_state, cpu, snext.band(), now)
                } else {
                    None
                };
                drop(peer_state);

                if let Some(speer) = speer {
                    *migrated = true;
                    return speer;
                }
            }
        }

        // No more important work elsewhere; run the local candidate.
        pcpu.runq_remove(state, &snext);
        snext
    }
}
