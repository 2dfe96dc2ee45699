// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{any::Any, collections::VecDeque, time::Instant};

use rustc_hash::FxHashMap;

use crate::{
    error::Error,
    task::{
        DaemonHooks,
        DaemonState,
        DoneFn,
        ExitStatus,
        Progress,
        Signal,
        SignalHandler,
        State,
        StepCx,
        StepFn,
        Task,
        TaskExit,
        TaskId,
    },
};

/// Wall-clock budget of one [`Scheduler::sched_timer`] invocation.
const SCHED_BUDGET_US: u64 = 150_000;

/// Minimum wall-clock budget granted to a task per activation.
const TASK_MIN_BUDGET_US: u64 = 40_000;

/// Cooperative scheduler over a run queue, a sleep list and a dead list.
///
/// Owned by the event core and driven once per second via
/// [`Scheduler::sched_timer`]. At most one task is running at any moment,
/// and only while `sched_timer` (or a synchronous `cancel`) is on the stack.
#[derive(Default)]
pub struct Scheduler {
    tasks: FxHashMap<u64, Task>,
    runq: VecDeque<u64>,
    sleeping: Vec<u64>,
    dead: Vec<u64>,
    running: Option<u64>,
    next_id: u64,

    completed: u64,
    killed: u64,
    errored: u64,
}

/// Point-in-time counters of a [`Scheduler`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub tasks: usize,
    pub runnable: usize,
    pub sleeping: usize,
    pub zombies: usize,
    pub completed: u64,
    pub killed: u64,
    pub errored: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain task. It becomes runnable immediately and gets its
    /// first activation on the next [`Scheduler::sched_timer`].
    ///
    /// `done`, if given, is invoked exactly once with the task's
    /// [`ExitStatus`] when it terminates, however it terminates.
    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        ctx: Box<dyn Any>,
        done: Option<DoneFn>,
    ) -> TaskId {
        let id = self.alloc_id();
        let mut task = Task::new(id, name.into(), steps, ctx);
        task.done = done;
        tracing::debug!(task = %TaskId(id), name = %task.name, "task created");
        self.tasks.insert(id, task);
        self.runq.push_back(id);
        TaskId(id)
    }

    /// Register a daemon: a task cycling its step vector over a work queue.
    ///
    /// Daemons are born sleeping; [`Scheduler::enqueue`] wakes them.
    pub fn spawn_daemon(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        ctx: Box<dyn Any>,
        hooks: DaemonHooks,
    ) -> TaskId {
        let id = self.alloc_id();
        let mut task = Task::new(id, name.into(), steps, ctx);
        task.daemon = Some(DaemonState {
            queue: VecDeque::new(),
            hooks,
        });
        task.state = State::Sleeping;
        tracing::debug!(task = %TaskId(id), name = %task.name, "daemon created");
        self.tasks.insert(id, task);
        self.sleeping.push(id);
        TaskId(id)
    }

    /// Append a work item to a daemon's queue, waking it if it sleeps.
    pub fn enqueue(&mut self, id: TaskId, item: Box<dyn Any>) -> Result<(), Error> {
        let woke = {
            let task = self.tasks.get_mut(&id.0).ok_or(Error::UnknownTask(id))?;
            if task.is_exited() {
                tracing::trace!(task = %id, "enqueue on terminated daemon ignored");
                return Ok(());
            }
            let state = task.state;
            let daemon = task.daemon.as_mut().ok_or(Error::NotDaemon(id))?;
            daemon.queue.push_back(item);
            if state == State::Sleeping {
                if let Some(notify) = daemon.hooks.notify.as_mut() {
                    notify(true);
                }
                true
            } else {
                false
            }
        };
        if woke {
            if let Some(task) = self.tasks.get_mut(&id.0) {
                task.state = State::Runnable;
            }
            self.sleeping.retain(|x| *x != id.0);
            self.runq.push_back(id.0);
        }
        Ok(())
    }

    /// Install (or replace) a signal handler, returning the previous one.
    pub fn signal(
        &mut self,
        id: TaskId,
        sig: Signal,
        handler: SignalHandler,
    ) -> Result<Option<SignalHandler>, Error> {
        let task = self.tasks.get_mut(&id.0).ok_or(Error::UnknownTask(id))?;
        match task.handler_pos(sig) {
            Some(pos) => {
                let (_, prev) = std::mem::replace(&mut task.handlers[pos], (sig, handler));
                Ok(Some(prev))
            },
            None => {
                task.handlers.push((sig, handler));
                Ok(None)
            },
        }
    }

    /// Send a signal.
    ///
    /// [`Signal::Kill`] terminates synchronously and cannot be caught. Any
    /// other signal is queued and delivered before the task's next step.
    pub fn send_signal(&mut self, id: TaskId, sig: Signal) -> Result<(), Error> {
        {
            let task = self.tasks.get_mut(&id.0).ok_or(Error::UnknownTask(id))?;
            if task.is_exited() {
                return Ok(());
            }
            if sig != Signal::Kill {
                task.pending.push_back(sig);
                return Ok(());
            }
        }
        let mut task = self
            .tasks
            .remove(&id.0)
            .expect("task looked up just above");
        self.unlink(id.0);
        task.last_signal = Some(Signal::Kill);
        self.finish(task, ExitStatus::Killed);
        Ok(())
    }

    /// Cancel a task: deliver [`Signal::Term`] through its handler if one is
    /// installed (switching to the task for the duration), then kill it.
    ///
    /// Cancelling an already-terminated task is a no-op.
    pub fn cancel(&mut self, id: TaskId) -> Result<(), Error> {
        let mut task = self.tasks.remove(&id.0).ok_or(Error::UnknownTask(id))?;
        if task.is_exited() {
            self.tasks.insert(id.0, task);
            return Ok(());
        }
        self.unlink(id.0);
        let prev = self.running.replace(id.0);
        let mut status = ExitStatus::Killed;
        if task.handler_pos(Signal::Term).is_some() {
            if let Some(exited) = deliver(&mut task, Signal::Term) {
                status = exited;
            }
        }
        self.running = prev;
        self.finish(task, status);
        Ok(())
    }

    /// The task's exit status, if it has terminated.
    ///
    /// Reading the status of a zombie releases it: the task is reclaimed on
    /// the next [`Scheduler::sched_timer`].
    pub fn exit_status(&mut self, id: TaskId) -> Option<ExitStatus> {
        let (status, release) = {
            let task = self.tasks.get_mut(&id.0)?;
            let status = task.status?;
            let release = task.zombie;
            task.zombie = false;
            (status, release)
        };
        if release {
            self.dead.push(id.0);
        }
        Some(status)
    }

    pub fn is_alive(&self, id: TaskId) -> bool {
        self.tasks.get(&id.0).map_or(false, |t| !t.is_exited())
    }

    /// Accounting snapshot of a task, while its shell is still around.
    pub fn task_info(&self, id: TaskId) -> Option<crate::task::TaskInfo> {
        self.tasks.get(&id.0).map(Task::info)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tasks: self.tasks.len(),
            runnable: self.runq.len(),
            sleeping: self.sleeping.len(),
            zombies: self.tasks.values().filter(|t| t.zombie).count(),
            completed: self.completed,
            killed: self.killed,
            errored: self.errored,
        }
    }

    /// One scheduling pass, to be driven once per second.
    ///
    /// Reclaims tasks terminated during the previous pass, then gives every
    /// runnable task at most one step activation, stopping early when the
    /// wall budget is consumed. Tasks that did not get a turn keep their
    /// position at the head of the run queue.
    pub fn sched_timer(&mut self) {
        self.reclaim();
        let runnable = self.runq.len();
        if runnable == 0 {
            return;
        }
        let budget = (SCHED_BUDGET_US / runnable as u64).max(TASK_MIN_BUDGET_US);
        let pass_started = Instant::now();
        let mut deferred = Vec::new();
        for _ in 0..runnable {
            let id = match self.runq.pop_front() {
                Some(id) => id,
                None => break,
            };
            if pass_started.elapsed().as_micros() as u64 >= SCHED_BUDGET_US {
                deferred.push(id);
                continue;
            }
            self.run_task(id, budget);
        }
        for id in deferred.into_iter().rev() {
            self.runq.push_front(id);
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn unlink(&mut self, id: u64) {
        self.runq.retain(|x| *x != id);
        self.sleeping.retain(|x| *x != id);
    }

    fn reclaim(&mut self) {
        for id in std::mem::take(&mut self.dead) {
            if self.tasks.remove(&id).is_some() {
                tracing::trace!(task = %TaskId(id), "task reclaimed");
            }
        }
    }

    fn requeue(&mut self, mut task: Task) {
        task.state = State::Runnable;
        let id = task.id;
        self.tasks.insert(id, task);
        self.runq.push_back(id);
    }

    /// One activation of `id`: pending signals, then a single step.
    fn run_task(&mut self, id: u64, budget_us: u64) {
        let mut task = match self.tasks.remove(&id) {
            Some(task) => task,
            None => return,
        };
        task.state = State::Running;
        self.running = Some(id);

        if let Some(status) = deliver_pending(&mut task) {
            self.running = None;
            self.finish(task, status);
            return;
        }

        match task.daemon.as_ref().map(|d| d.queue.is_empty()) {
            Some(true) => {
                // A runnable daemon without work is a queue-accounting bug;
                // put it back to sleep rather than running a step on nothing.
                tracing::warn!(task = %TaskId(id), "runnable daemon with empty queue");
                task.state = State::Sleeping;
                self.running = None;
                self.tasks.insert(id, task);
                self.sleeping.push(id);
                return;
            },
            Some(false) if task.step == 0 && task.seqno == 0 => {
                let Task { ctx, daemon, .. } = &mut task;
                if let Some(DaemonState { queue, hooks }) = daemon.as_mut() {
                    if let (Some(start), Some(item)) = (hooks.start.as_mut(), queue.front_mut()) {
                        start(ctx.as_mut(), item.as_mut());
                    }
                }
            },
            _ => {},
        }

        let granted = task.grant(budget_us);
        let step_started = Instant::now();
        let (outcome, used) = {
            let Task {
                name,
                steps,
                step,
                seqno,
                ctx,
                daemon,
                ..
            } = &mut task;
            let item = daemon
                .as_mut()
                .and_then(|d| d.queue.front_mut())
                .map(|b| b.as_mut());
            let mut cx = StepCx {
                name: name.as_str(),
                step: *step,
                seqno: *seqno,
                granted,
                used: None,
                ctx: ctx.as_mut(),
                item,
            };
            let outcome = (steps[*step])(&mut cx);
            (outcome, cx.used)
        };
        task.account(used, step_started.elapsed().as_micros() as u64);
        self.running = None;

        match outcome {
            Err(TaskExit { code }) => {
                task.exit_code = code;
                let status = if code == 0 {
                    ExitStatus::Ok
                } else {
                    ExitStatus::Error(code)
                };
                self.finish(task, status);
            },
            Ok(Progress::Error) => {
                task.exit_code = -1;
                self.finish(task, ExitStatus::Error(-1));
            },
            Ok(Progress::More) => {
                task.seqno += 1;
                self.requeue(task);
            },
            Ok(Progress::Next) => {
                if task.step + 1 < task.steps.len() {
                    task.step += 1;
                    task.seqno = 0;
                    task.tick_cost_us = 0.0;
                    task.prev_ticks = 0;
                    self.requeue(task);
                } else {
                    self.steps_exhausted(task);
                }
            },
            Ok(Progress::Done) => self.steps_exhausted(task),
        }
    }

    /// The step vector ran to completion: end of task, or of a daemon item.
    fn steps_exhausted(&mut self, mut task: Task) {
        if task.daemon.is_none() {
            self.finish(task, ExitStatus::Ok);
            return;
        }

        {
            let Task { ctx, daemon, .. } = &mut task;
            let daemon = daemon.as_mut().expect("checked to be a daemon above");
            if let (Some(end), Some(item)) = (daemon.hooks.end.as_mut(), daemon.queue.front_mut())
            {
                end(ctx.as_mut(), item.as_mut());
            }
            daemon.queue.pop_front();
        }
        task.step = 0;
        task.seqno = 0;
        task.tick_cost_us = 0.0;
        task.prev_ticks = 0;

        let id = task.id;
        let empty = task
            .daemon
            .as_ref()
            .map_or(true, |daemon| daemon.queue.is_empty());
        if empty {
            if let Some(notify) = task.daemon.as_mut().and_then(|d| d.hooks.notify.as_mut()) {
                notify(false);
            }
            task.state = State::Sleeping;
            self.tasks.insert(id, task);
            self.sleeping.push(id);
        } else {
            self.requeue(task);
        }
    }

    fn finish(&mut self, mut task: Task, status: ExitStatus) {
        match status {
            ExitStatus::Ok => self.completed += 1,
            ExitStatus::Killed => self.killed += 1,
            ExitStatus::Error(_) => self.errored += 1,
        }
        tracing::debug!(
            task = %TaskId(task.id),
            name = %task.name,
            status = ?status,
            "task terminated"
        );
        task.state = State::Exited;
        task.status = Some(status);
        task.release();
        let id = task.id;
        match task.done.take() {
            Some(done) => {
                done(status);
                self.dead.push(id);
            },
            None if status != ExitStatus::Ok => {
                // Nobody listening: keep the status around until it is read.
                task.zombie = true;
            },
            None => self.dead.push(id),
        }
        self.tasks.insert(id, task);
    }
}

/// Drain queued signals; `Some` means the task terminated.
fn deliver_pending(task: &mut Task) -> Option<ExitStatus> {
    while let Some(sig) = task.pending.pop_front() {
        if let Some(status) = deliver(task, sig) {
            return Some(status);
        }
    }
    None
}

fn deliver(task: &mut Task, sig: Signal) -> Option<ExitStatus> {
    task.last_signal = Some(sig);
    if sig == Signal::Kill {
        return Some(ExitStatus::Killed);
    }
    match task.handler_pos(sig) {
        Some(pos) => match run_handler(task, pos, sig) {
            Err(TaskExit { code }) => {
                task.exit_code = code;
                Some(if code == 0 {
                    ExitStatus::Ok
                } else {
                    ExitStatus::Error(code)
                })
            },
            Ok(()) => None,
        },
        None => match sig {
            Signal::Term => Some(ExitStatus::Killed),
            Signal::Zero | Signal::User(_) => None,
            Signal::Kill => unreachable!("handled above"),
        },
    }
}

/// Run a signal handler in the task's context. Handler time is charged to
/// the task's wall time but yields no tick-cost sample.
fn run_handler(task: &mut Task, pos: usize, sig: Signal) -> Result<(), TaskExit> {
    let (slot, mut handler) = task.handlers.remove(pos);
    let started = Instant::now();
    let res = {
        let Task {
            name,
            step,
            seqno,
            ctx,
            daemon,
            ..
        } = task;
        let item = daemon
            .as_mut()
            .and_then(|d| d.queue.front_mut())
            .map(|b| b.as_mut());
        let mut cx = StepCx {
            name: name.as_str(),
            step: *step,
            seqno: *seqno,
            granted: 0,
            used: None,
            ctx: ctx.as_mut(),
            item,
        };
        handler(&mut cx, sig)
    };
    task.wall_time_us += started.elapsed().as_micros() as u64;
    task.handlers.push((slot, handler));
    res
}
