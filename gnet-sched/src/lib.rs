// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Cooperative background tasks for a single-threaded event core.
//!
//! Long-running CPU or I/O work is split into _steps_, and steps are charged
//! in _ticks_: an abstract work unit whose real cost is estimated from wall
//! time, so that one [`Scheduler::sched_timer`] invocation (driven once per
//! second by the event loop) stays within a fixed wall-clock budget no matter
//! how many tasks are runnable.
//!
//! Two task flavours exist: plain tasks, which run their step vector once and
//! terminate, and daemons, which cycle their step vector over a work queue
//! and sleep when the queue drains.
//!
//! There is no preemption and there are no priorities. A step runs to
//! completion once entered; the only scheduling points are step boundaries.

pub mod error;
pub use error::Error;

mod sched;
pub use sched::{Scheduler, Stats};

mod task;
pub use task::{
    DaemonHooks,
    DoneFn,
    ExitStatus,
    Progress,
    Signal,
    SignalHandler,
    StepCx,
    StepFn,
    TaskExit,
    TaskId,
    TaskInfo,
};
