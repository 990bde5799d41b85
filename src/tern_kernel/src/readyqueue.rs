//! Priority-segregated task queues.
//!
//! [`PrioSet`] is the building block shared by the per-core ready queues and
//! every wait queue: one FIFO per priority level, threaded through a dense
//! priority bitmap. Insertion appends to a bucket tail and sets the bucket's
//! bit; removal of the most urgent task reads the bitmap's highest set bit
//! and pops that bucket's head. Both are constant-time in the number of
//! queued tasks.
//!
//! Tasks are linked through `TaskCb::link`, so a task can be a member of at
//! most one `PrioSet` at any time - which is exactly the kernel invariant
//! "a task is on at most one ready or wait queue".
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    task::TaskCb,
    utils::{Init, PrioBitmap, PRIO_LEVEL_CAP},
    PortThreading, Priority, TaskRef,
};

/// A doubly-linked FIFO of tasks, one per priority level.
pub(crate) struct ListHead<Traits: PortThreading> {
    pub(crate) first: Option<TaskRef<Traits>>,
    pub(crate) last: Option<TaskRef<Traits>>,
}

// `#[derive(Clone, Copy)]` would put a bound on `Traits`
impl<Traits: PortThreading> Clone for ListHead<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for ListHead<Traits> {}

impl<Traits: PortThreading> Init for ListHead<Traits> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

/// A task's membership in a [`PrioSet`], stored in `TaskCb::link`.
pub(crate) struct QueueLink<Traits: PortThreading> {
    pub(crate) prev: Option<TaskRef<Traits>>,
    pub(crate) next: Option<TaskRef<Traits>>,
    /// The priority bucket the task is linked into. Snapshotted at insertion
    /// time; the task's effective priority may change afterwards, in which
    /// case the owner of the queue repositions the task.
    pub(crate) prio: Priority,
}

impl<Traits: PortThreading> Clone for QueueLink<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for QueueLink<Traits> {}

/// A set of tasks ordered by (priority, FIFO arrival).
pub(crate) struct PrioSet<Traits: PortThreading> {
    /// Invariant: `buckets[i].first.is_some() == bitmap.get(i)`
    buckets: [CpuLockCell<Traits, ListHead<Traits>>; PRIO_LEVEL_CAP],
    bitmap: CpuLockCell<Traits, PrioBitmap>,
}

impl<Traits: PortThreading> Init for PrioSet<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        buckets: Init::INIT,
        bitmap: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for PrioSet<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PrioSet")
            .field("bitmap", &self.bitmap)
            .finish_non_exhaustive()
    }
}

impl<Traits: PortThreading> PrioSet<Traits> {
    /// The priority of the most urgent member, if any.
    #[inline]
    pub(crate) fn highest_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<Priority> {
        self.bitmap
            .read(&*lock)
            .find_highest_set()
            .map(|i| i as Priority)
    }

    #[inline]
    pub(crate) fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.bitmap.read(&*lock).is_empty()
    }

    /// Insert `task` at the back of the bucket for `prio`.
    ///
    /// `task` must not currently be a member of any `PrioSet`.
    pub(crate) fn push_back(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        prio: Priority,
    ) {
        debug_assert!(task.link.read(&*lock).is_none());

        let mut head = self.buckets[prio as usize].get(&*lock);
        match head.last {
            Some(tail) => {
                let mut tail_link = tail.link.get(&*lock).unwrap();
                tail_link.next = Some(task);
                tail.link.replace(&mut *lock, Some(tail_link));
                task.link.replace(
                    &mut *lock,
                    Some(QueueLink {
                        prev: Some(tail),
                        next: None,
                        prio,
                    }),
                );
                head.last = Some(task);
            }
            None => {
                task.link.replace(
                    &mut *lock,
                    Some(QueueLink {
                        prev: None,
                        next: None,
                        prio,
                    }),
                );
                head.first = Some(task);
                head.last = Some(task);
                self.bitmap.write(&mut *lock).set(prio as usize);
            }
        }
        self.buckets[prio as usize].replace(&mut *lock, head);
    }

    /// Remove and return the head of the most urgent non-empty bucket.
    pub(crate) fn pop_highest(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        let prio = self.highest_priority(lock.borrow_mut())?;
        let head = self.buckets[prio as usize].get(&*lock);
        // The bitmap said the bucket is non-empty
        let task = head.first.unwrap();
        self.remove(lock, task);
        Some(task)
    }

    /// The head of the most urgent non-empty bucket, without removing it.
    pub(crate) fn front(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        let prio = self.highest_priority(lock.borrow_mut())?;
        self.buckets[prio as usize].get(&*lock).first
    }

    /// The member following `task` in (priority, FIFO) order.
    pub(crate) fn next_after(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
    ) -> Option<TaskRef<Traits>> {
        let link = task.link.get(&*lock).unwrap();
        if let Some(next) = link.next {
            return Some(next);
        }
        // Fall through to the next lower non-empty bucket
        let bitmap = self.bitmap.get(&*lock);
        (0..link.prio as usize)
            .rev()
            .find(|&i| bitmap.get(i))
            .and_then(|i| self.buckets[i].get(&*lock).first)
    }

    /// Unlink `task`, which must be a member of this set.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: TaskRef<Traits>) {
        let link = task.link.replace(&mut *lock, None).unwrap();
        let prio = link.prio as usize;
        let mut head = self.buckets[prio].get(&*lock);

        match link.prev {
            Some(prev) => {
                let mut prev_link = prev.link.get(&*lock).unwrap();
                prev_link.next = link.next;
                prev.link.replace(&mut *lock, Some(prev_link));
            }
            None => head.first = link.next,
        }
        match link.next {
            Some(next) => {
                let mut next_link = next.link.get(&*lock).unwrap();
                next_link.prev = link.prev;
                next.link.replace(&mut *lock, Some(next_link));
            }
            None => head.last = link.prev,
        }

        if head.first.is_none() {
            self.bitmap.write(&mut *lock).clear(prio);
        }
        self.buckets[prio].replace(&mut *lock, head);
    }

    /// Whether the bucket for `prio` has any member.
    #[inline]
    pub(crate) fn has_task_at(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prio: Priority,
    ) -> bool {
        self.bitmap.read(&*lock).get(prio as usize)
    }

    /// Find the first member satisfying `pred`, scanning from the *least*
    /// urgent priority up and in FIFO order within a bucket.
    pub(crate) fn find_lowest_first(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut pred: impl FnMut(CpuLockTokenRefMut<'_, Traits>, TaskRef<Traits>) -> bool,
    ) -> Option<TaskRef<Traits>> {
        for prio in 0..PRIO_LEVEL_CAP {
            if !self.bitmap.read(&*lock).get(prio) {
                continue;
            }
            let mut cur = self.buckets[prio].get(&*lock).first;
            while let Some(task) = cur {
                if pred(lock.borrow_mut(), task) {
                    return Some(task);
                }
                cur = task.link.get(&*lock).unwrap().next;
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------

/// The result type of [`ReadyQueue::pop_front_task`].
pub(crate) enum ScheduleDecision<T> {
    /// The kernel should not perform a context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform a context switch to the specified task.
    SwitchTo(Option<T>),
}

/// A per-core ready set: tracks the Ready tasks eligible for one core,
/// sorted by (effective priority, FIFO arrival).
pub(crate) struct ReadyQueue<Traits: PortThreading> {
    set: PrioSet<Traits>,
}

impl<Traits: PortThreading> Init for ReadyQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { set: Init::INIT };
}

impl<Traits: PortThreading> fmt::Debug for ReadyQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadyQueue").finish_non_exhaustive()
    }
}

impl<Traits: PortThreading> ReadyQueue<Traits> {
    /// Insert a Ready task, as close to the back as possible without
    /// violating the priority ordering.
    ///
    /// `task` must not currently be a member of any queue.
    pub(crate) fn push_back_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        effective_priority: Priority,
    ) {
        self.set.push_back(lock, task, effective_priority);
    }

    /// Choose the next task to schedule.
    ///
    /// `prev_task_priority` is the effective priority of the task that would
    /// keep running if this decision requests no switch, or `None` if there
    /// is no such task (the previous task blocked, exited, or the scheduler
    /// is dispatching for the first time).
    ///
    /// | Current task runnable? | More urgent task Ready? | Returns             |
    /// | ---------------------- | ----------------------- | ------------------- |
    /// | no                     | (any)                   | `SwitchTo(_)`       |
    /// | yes                    | no                      | `Keep`              |
    /// | yes                    | yes                     | `SwitchTo(Some(_))` |
    ///
    /// Equal priority does not preempt; round-robin rotation is performed
    /// explicitly by the tick handler.
    pub(crate) fn pop_front_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        prev_task_priority: Option<Priority>,
    ) -> ScheduleDecision<TaskRef<Traits>> {
        let next_priority = self.set.highest_priority(lock.borrow_mut());

        match (prev_task_priority, next_priority) {
            (Some(prev), Some(next)) if next <= prev => ScheduleDecision::Keep,
            (Some(_), None) => ScheduleDecision::Keep,
            (None, None) => ScheduleDecision::SwitchTo(None),
            _ => ScheduleDecision::SwitchTo(self.set.pop_highest(lock)),
        }
    }

    /// Return `true` if a Ready task outranks `prio` (`None` = any Ready
    /// task qualifies).
    pub(crate) fn has_ready_task_above(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prio: Option<Priority>,
    ) -> bool {
        match (self.set.highest_priority(lock), prio) {
            (Some(next), Some(prev)) => next > prev,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Whether a Ready task exists at exactly `prio` (used for round-robin).
    pub(crate) fn has_task_at(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prio: Priority,
    ) -> bool {
        self.set.has_task_at(lock, prio)
    }

    /// Unlink a task that is leaving the Ready state (suspension, deletion,
    /// or migration).
    pub(crate) fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: TaskRef<Traits>) {
        self.set.remove(lock, task);
    }

    /// Reposition a Ready task after a change of its effective priority.
    pub(crate) fn reorder_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        effective_priority: Priority,
    ) {
        self.set.remove(lock.borrow_mut(), task);
        self.set.push_back(lock, task, effective_priority);
    }

    /// Find a member satisfying `pred`, scanning the least urgent tasks
    /// first. Used by the load balancer to pick a migration victim.
    pub(crate) fn find_lowest_first(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        pred: impl FnMut(CpuLockTokenRefMut<'_, Traits>, TaskRef<Traits>) -> bool,
    ) -> Option<TaskRef<Traits>> {
        self.set.find_lowest_first(lock, pred)
    }
}
