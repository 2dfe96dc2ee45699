// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    any::Any,
    collections::VecDeque,
    fmt::{self, Display},
};

/// Opaque handle to a task registered with a [`crate::Scheduler`].
///
/// Handles stay valid until the task is reclaimed; operations on a reclaimed
/// handle yield [`crate::Error::UnknownTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bg:{}", self.0)
    }
}

/// What a step reports back to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The current step has more work; call it again.
    More,
    /// The current step is finished; advance to the next one.
    Next,
    /// The whole task (or, for a daemon, the current work item) is finished.
    Done,
    /// The step failed; terminate the task with exit code -1.
    Error,
}

/// Non-local exit from inside a step or signal handler.
///
/// Steps return `Result<Progress, TaskExit>`, so `?` unwinds straight back to
/// the scheduler frame, which records the exit code and terminates the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskExit {
    pub code: i32,
}

/// Signals deliverable to a task.
///
/// [`Signal::Kill`] is uncatchable and terminates synchronously.
/// [`Signal::Term`] runs the installed handler, or terminates if there is
/// none. [`Signal::Zero`] is a no-op unless a handler is installed.
/// [`Signal::User`] slots carry application-defined meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Zero,
    Term,
    Kill,
    User(u8),
}

/// How a task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Ran to completion, or exited with code 0.
    Ok,
    /// Terminated by [`Signal::Kill`] (directly or via `cancel`).
    Killed,
    /// A step reported [`Progress::Error`], or the task exited non-zero.
    Error(i32),
}

pub type StepFn = Box<dyn FnMut(&mut StepCx) -> Result<Progress, TaskExit>>;
pub type SignalHandler = Box<dyn FnMut(&mut StepCx, Signal) -> Result<(), TaskExit>>;
pub type DoneFn = Box<dyn FnOnce(ExitStatus)>;

/// Hooks driving a daemon's work-queue cycle.
///
/// `start` runs before the first step of each item, `end` after the step
/// vector finished an item, `notify` on wake (`true`) and sleep (`false`).
/// Both item hooks receive the task context and the current item.
#[derive(Default)]
pub struct DaemonHooks {
    pub start: Option<Box<dyn FnMut(&mut dyn Any, &mut dyn Any)>>,
    pub end: Option<Box<dyn FnMut(&mut dyn Any, &mut dyn Any)>>,
    pub notify: Option<Box<dyn FnMut(bool)>>,
}

/// Execution context handed to steps and signal handlers.
///
/// Borrows the task's context (and, for daemons, the work item at the head
/// of the queue) for the duration of the call.
pub struct StepCx<'a> {
    pub(crate) name: &'a str,
    pub(crate) step: usize,
    pub(crate) seqno: u64,
    pub(crate) granted: u32,
    pub(crate) used: Option<u32>,
    pub(crate) ctx: &'a mut dyn Any,
    pub(crate) item: Option<&'a mut dyn Any>,
}

impl StepCx<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Index of the currently executing step.
    pub fn step(&self) -> usize {
        self.step
    }

    /// How many times the current step has returned [`Progress::More`].
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Ticks granted for this activation. Zero inside signal handlers.
    pub fn ticks(&self) -> u32 {
        self.granted
    }

    /// Declare that only `used` of the granted ticks were consumed.
    ///
    /// Declaring zero suppresses the cost sample for this activation.
    pub fn ticks_used(&mut self, used: u32) {
        self.used = Some(used.min(self.granted))
    }

    /// The task's typed context.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the type the task was created with -- that is a
    /// bug in the calling code, not a runtime condition.
    pub fn context<T: 'static>(&mut self) -> &mut T {
        self.ctx
            .downcast_mut()
            .expect("task context downcast to the type it was created with")
    }

    /// The daemon work item currently being processed, if any.
    pub fn item<T: 'static>(&mut self) -> Option<&mut T> {
        self.item.as_mut().and_then(|item| item.downcast_mut())
    }

    /// Construct the non-local exit value: `return Err(cx.exit(code))`.
    pub fn exit(&self, code: i32) -> TaskExit {
        TaskExit { code }
    }
}

/// Observable accounting of one task, surfaced for stats displays.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskInfo {
    pub name: String,
    pub step: usize,
    pub seqno: u64,
    pub exit_code: i32,
    pub last_signal: Option<Signal>,
    pub ticks_granted: u32,
    pub ticks_used: u32,
    pub tick_cost_us: f64,
    pub last_elapsed_us: u64,
    pub wall_time_us: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Runnable,
    Running,
    Sleeping,
    Exited,
}

pub(crate) struct DaemonState {
    pub queue: VecDeque<Box<dyn Any>>,
    pub hooks: DaemonHooks,
}

pub(crate) struct Task {
    pub id: u64,
    pub name: String,
    pub state: State,
    pub steps: Vec<StepFn>,
    pub step: usize,
    pub seqno: u64,
    pub ctx: Box<dyn Any>,
    pub done: Option<DoneFn>,
    pub handlers: Vec<(Signal, SignalHandler)>,
    pub pending: VecDeque<Signal>,
    pub last_signal: Option<Signal>,
    pub exit_code: i32,
    pub status: Option<ExitStatus>,
    pub zombie: bool,
    pub daemon: Option<DaemonState>,

    // Tick accounting.
    pub prev_ticks: u32,
    pub ticks_granted: u32,
    pub ticks_used: u32,
    pub tick_cost_us: f64,
    pub last_elapsed_us: u64,
    pub wall_time_us: u64,
}

/// Granted ticks may change by at most this factor between activations.
const TICK_DELTA_MAX: u32 = 4;

impl Task {
    pub fn new(id: u64, name: String, steps: Vec<StepFn>, ctx: Box<dyn Any>) -> Self {
        assert!(!steps.is_empty(), "a task needs at least one step");
        Self {
            id,
            name,
            state: State::Runnable,
            steps,
            step: 0,
            seqno: 0,
            ctx,
            done: None,
            handlers: Vec::new(),
            pending: VecDeque::new(),
            last_signal: None,
            exit_code: 0,
            status: None,
            zombie: false,
            daemon: None,
            prev_ticks: 0,
            ticks_granted: 0,
            ticks_used: 0,
            tick_cost_us: 0.0,
            last_elapsed_us: 0,
            wall_time_us: 0,
        }
    }

    /// Ticks to grant for an activation worth `budget_us` of wall time.
    ///
    /// `1 + budget / tick_cost`, clamped so the grant varies from the
    /// previous one by at most ×[`TICK_DELTA_MAX`] in either direction.
    pub fn grant(&mut self, budget_us: u64) -> u32 {
        let mut ticks = if self.tick_cost_us > 0.0 {
            1 + (budget_us as f64 / self.tick_cost_us) as u32
        } else {
            1
        };
        if self.prev_ticks > 0 {
            let lo = (self.prev_ticks / TICK_DELTA_MAX).max(1);
            let hi = self.prev_ticks.saturating_mul(TICK_DELTA_MAX);
            ticks = ticks.min(hi).max(lo);
        }
        self.ticks_granted = ticks;
        ticks
    }

    /// Fold one activation into the cost model.
    ///
    /// A declared use of zero ticks suppresses the sample; otherwise the
    /// per-tick cost moves by an EMA weighing history 4:1.
    pub fn account(&mut self, used: Option<u32>, elapsed_us: u64) {
        let used = used.unwrap_or(self.ticks_granted);
        self.ticks_used = used;
        self.prev_ticks = self.ticks_granted;
        self.last_elapsed_us = elapsed_us;
        self.wall_time_us += elapsed_us;
        if used > 0 && elapsed_us > 0 {
            let sample = elapsed_us as f64 / f64::from(used);
            self.tick_cost_us = if self.tick_cost_us > 0.0 {
                (4.0 * self.tick_cost_us + sample) / 5.0
            } else {
                sample
            };
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            step: self.step,
            seqno: self.seqno,
            exit_code: self.exit_code,
            last_signal: self.last_signal,
            ticks_granted: self.ticks_granted,
            ticks_used: self.ticks_used,
            tick_cost_us: self.tick_cost_us,
            last_elapsed_us: self.last_elapsed_us,
            wall_time_us: self.wall_time_us,
        }
    }

    pub fn handler_pos(&self, sig: Signal) -> Option<usize> {
        self.handlers.iter().position(|(s, _)| *s == sig)
    }

    pub fn is_exited(&self) -> bool {
        self.state == State::Exited
    }

    /// Drop everything the task owns beyond its id/status shell.
    ///
    /// Called on termination: contexts, step closures, handlers and queued
    /// work items must not outlive the task, even though the shell lingers
    /// until the next scheduler tick (or until a zombie's status is read).
    pub fn release(&mut self) {
        self.steps = Vec::new();
        self.handlers = Vec::new();
        self.pending = VecDeque::new();
        self.ctx = Box::new(());
        if let Some(d) = self.daemon.as_mut() {
            d.queue.clear();
        }
    }
}
