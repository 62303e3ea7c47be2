//! Credit scheduler
//!
//! This crate implements a proportional-share CPU scheduler for
//! hypervisor vCPUs. Each domain holds a weight; over an accounting
//! period every runnable domain receives CPU time in proportion to its
//! weight, with an optional per-domain cap as an upper bound. On top of
//! the credit algorithm, a per-domain closed loop tunes the scheduling
//! time slice in the sub-millisecond range from PMC feedback
//! (instructions retired, LLC misses, paravirt spinlock latency), so
//! lock-contention-heavy guests run short slices and cache-sensitive
//! guests run long ones.
//!
//! ## Module Organization
//!
//! - `types`: identifiers, priority bands, CPU masks, constants
//! - `config`: boot parameters and runtime-adjustable knobs
//! - `upcalls`: the `Hypervisor` trait the embedder implements
//! - `domain`: per-domain records and slice publication
//! - `vcpu`: per-vCPU records and credit burn
//! - `runq`: the per-pCPU priority-ordered runqueue
//! - `pcpu`: per-pCPU state and the accounting tick
//! - `acct`: the master credit accountant
//! - `smp`: topology-aware CPU picking and work stealing
//! - `metrics`: PMC sampling and the adaptive slice controller
//! - `core`: the scheduler object, lifecycle ops and dispatch
//! - `stats`: counters and diagnostic dumps

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod acct;
mod config;
mod core;
mod domain;
mod metrics;
mod pcpu;
mod runq;
mod smp;
mod stats;
mod types;
mod upcalls;
mod vcpu;

// Re-export the external interface.
pub use crate::core::{
    CreditScheduler, DomainOp, DomainSchedInfo, GlobalOp, GlobalSchedInfo,
};
pub use config::SchedParams;
pub use stats::SchedCounters;
pub use types::{
    Band, CpuMask, DomainId, EventSample, Phase, SchedError, TaskSlice, VcpuFlags, VcpuId,
};
pub use upcalls::{Hypervisor, TimerKind};

// Re-export the tunables' bounds and defaults.
pub use types::{
    CREDITS_PER_MSEC, DEFAULT_RATELIMIT_US, DEFAULT_TSLICE_US, DEFAULT_WEIGHT,
    EVENT_TRACKING_WINDOW, MAX_PCPUS, METRIC_TICK_PERIOD_US, RATELIMIT_US_MAX, RATELIMIT_US_MIN,
    SLICE_MAX_US, SLICE_MIN_US, TICKS_PER_TSLICE, TSLICE_US_MAX, TSLICE_US_MIN,
};
