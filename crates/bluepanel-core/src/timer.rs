//! Single-shot delayed tasks.
//!
//! The coordinator never sleeps. Anything time-based (discoverable auto
//! revert, scan cycling, agent response timeout) is expressed as a task
//! handed to a [`Scheduler`] owned by the embedding event loop.
//! [`DelayedTask`] wraps one restartable timer slot: arming replaces the
//! previous timer, and a superseded timer that fires anyway is ignored.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

/// Identifies a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Event-loop hook for running closures after a delay.
pub trait Scheduler {
    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerToken;

    /// Drop a scheduled task. Returns false if it already ran or was unknown.
    fn cancel(&self, token: TimerToken) -> bool;
}

struct SlotState {
    generation: Cell<u64>,
    token: Cell<Option<TimerToken>>,
}

/// A named, restartable single-shot timer slot.
pub struct DelayedTask {
    name: &'static str,
    scheduler: Rc<dyn Scheduler>,
    state: Rc<SlotState>,
}

impl DelayedTask {
    pub fn new(name: &'static str, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            name,
            scheduler,
            state: Rc::new(SlotState {
                generation: Cell::new(0),
                token: Cell::new(None),
            }),
        }
    }

    /// Schedule `task` after `delay`, replacing any timer already armed.
    pub fn arm<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.disarm();

        let generation = self.state.generation.get();
        let state = Rc::downgrade(&self.state);
        let name = self.name;

        let token = self.scheduler.schedule(
            delay,
            Box::new(move || {
                let Some(state) = state.upgrade() else {
                    return;
                };
                if state.generation.get() != generation {
                    debug!("{}: superseded timer fired, ignoring", name);
                    return;
                }
                state.token.set(None);
                state.generation.set(generation + 1);
                task();
            }),
        );

        trace!("{}: armed for {:?}", self.name, delay);
        self.state.token.set(Some(token));
    }

    /// Cancel the pending timer, if any.
    pub fn disarm(&self) {
        if let Some(token) = self.state.token.take() {
            trace!("{}: disarmed", self.name);
            self.scheduler.cancel(token);
        }
        self.state
            .generation
            .set(self.state.generation.get().wrapping_add(1));
    }

    pub fn is_armed(&self) -> bool {
        self.state.token.get().is_some()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.disarm();
    }
}

type QueuedTask = Box<dyn FnOnce()>;

/// A scheduler driven by explicit calls to [`ManualScheduler::advance`].
///
/// Used for virtual-time replays and tests. Tasks due at the same instant
/// run in the order they were scheduled.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_token: Cell<u64>,
    queue: RefCell<BTreeMap<(Duration, TimerToken), QueuedTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Move the clock forward, running every task that becomes due.
    ///
    /// Tasks scheduled by running tasks are honoured if they fall inside
    /// the window. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now.get() + by;
        let mut fired = 0;

        loop {
            let next = {
                let mut queue = self.queue.borrow_mut();
                match queue.first_key_value() {
                    Some((&(due, _), _)) if due <= target => queue.pop_first(),
                    _ => None,
                }
            };
            let Some(((due, _), task)) = next else {
                break;
            };
            self.now.set(due);
            task();
            fired += 1;
        }

        self.now.set(target);
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerToken {
        let token = TimerToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.queue
            .borrow_mut()
            .insert((self.now.get() + delay, token), task);
        token
    }

    fn cancel(&self, token: TimerToken) -> bool {
        let mut queue = self.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|(_, t), _| *t != token);
        queue.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> Box<dyn FnOnce()>) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let make = move || -> Box<dyn FnOnce()> {
            let c = c.clone();
            Box::new(move || c.set(c.get() + 1))
        };
        (count, make)
    }

    #[test]
    fn test_manual_scheduler_runs_due_tasks_in_order() {
        let scheduler = ManualScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, label) in [(5, "b"), (1, "a"), (5, "c")] {
            let order = order.clone();
            scheduler.schedule(
                Duration::from_secs(delay),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }

        assert_eq!(scheduler.advance(Duration::from_secs(4)), 1);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 2);
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.now(), Duration::from_secs(5));
    }

    #[test]
    fn test_manual_scheduler_cancel() {
        let scheduler = ManualScheduler::new();
        let (count, make) = counter();

        let token = scheduler.schedule(Duration::from_secs(1), make());
        assert!(scheduler.cancel(token));
        assert!(!scheduler.cancel(token));

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_delayed_task_fires_once() {
        let scheduler = Rc::new(ManualScheduler::new());
        let task = DelayedTask::new("test", scheduler.clone());
        let (count, make) = counter();

        task.arm(Duration::from_secs(2), make());
        assert!(task.is_armed());

        scheduler.advance(Duration::from_secs(2));
        assert_eq!(count.get(), 1);
        assert!(!task.is_armed());

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_delayed_task_rearm_restarts() {
        let scheduler = Rc::new(ManualScheduler::new());
        let task = DelayedTask::new("test", scheduler.clone());
        let (count, make) = counter();

        task.arm(Duration::from_secs(10), make());
        scheduler.advance(Duration::from_secs(8));
        task.arm(Duration::from_secs(10), make());

        scheduler.advance(Duration::from_secs(8));
        assert_eq!(count.get(), 0, "first timer must have been replaced");
        assert_eq!(scheduler.pending(), 1);

        scheduler.advance(Duration::from_secs(2));
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_delayed_task_disarm_and_drop() {
        let scheduler = Rc::new(ManualScheduler::new());
        let (count, make) = counter();

        let task = DelayedTask::new("test", scheduler.clone());
        task.arm(Duration::from_secs(1), make());
        task.disarm();
        assert!(!task.is_armed());

        let dropped = DelayedTask::new("dropped", scheduler.clone());
        dropped.arm(Duration::from_secs(1), make());
        drop(dropped);

        scheduler.advance(Duration::from_secs(5));
        assert_eq!(count.get(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_delayed_task_can_rearm_from_its_own_callback() {
        let scheduler = Rc::new(ManualScheduler::new());
        let task = Rc::new(DelayedTask::new("cycle", scheduler.clone()));
        let count = Rc::new(Cell::new(0));

        fn arm_cycle(task: &Rc<DelayedTask>, count: &Rc<Cell<u32>>) {
            let weak = Rc::downgrade(task);
            let count = count.clone();
            task.arm(Duration::from_secs(1), move || {
                count.set(count.get() + 1);
                if let Some(task) = weak.upgrade() {
                    arm_cycle(&task, &count);
                }
            });
        }

        arm_cycle(&task, &count);
        scheduler.advance(Duration::from_secs(3));
        assert_eq!(count.get(), 3);
        assert!(task.is_armed());
    }
}
