//! Symmetric multi-processing: core affinity, initial placement, load
//! tracking, and the periodic load balancer.
use core::fmt;

use crate::{
    error::BadParamError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    trace,
    utils::Init,
    KernelTraits, Priority, TaskRef, Ticks,
};

/// Declares which cores a task may execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// The scheduler may place the task on either core, and the load
    /// balancer may migrate it.
    Any,
    Core0,
    Core1,
}

impl Affinity {
    /// Whether a task with this affinity may run on `core`.
    #[inline]
    pub fn allows(self, core: usize) -> bool {
        match self {
            Self::Any => true,
            Self::Core0 => core == 0,
            Self::Core1 => core == 1,
        }
    }

    /// Whether this affinity names at least one of the first `num_cores`
    /// cores.
    pub(crate) fn allows_any_of(self, num_cores: usize) -> bool {
        (0..num_cores).any(|c| self.allows(c))
    }

    pub(crate) fn pinned_to(core: usize) -> Self {
        match core {
            0 => Self::Core0,
            _ => Self::Core1,
        }
    }
}

/// Initial placement strategy for `Any`-affinity tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStrategy {
    /// Alternate between the cores.
    RoundRobin,
    /// Place on the core with the lower sliding-window load.
    LeastLoaded,
    /// Bias urgent tasks toward the historically less busy core and bulk
    /// work toward the other.
    PriorityBased,
}

impl Init for AssignmentStrategy {
    const INIT: Self = Self::RoundRobin;
}

// ---------------------------------------------------------------------------
// Load tracking

/// Number of tick samples in the sliding load window.
const LOAD_WINDOW: u32 = 128;

/// Sliding-window CPU utilization of one core: one bit per tick sample,
/// set when the core was running something other than its idle task.
#[derive(Clone, Copy)]
pub(crate) struct LoadWindow {
    bits: u128,
    busy: u16,
    samples: u16,
}

impl Init for LoadWindow {
    const INIT: Self = Self {
        bits: 0,
        busy: 0,
        samples: 0,
    };
}

impl fmt::Debug for LoadWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LoadWindow({}%)", self.percent())
    }
}

impl LoadWindow {
    /// Record one tick sample.
    pub(crate) fn push(&mut self, busy: bool) {
        let evicted = (self.bits >> (LOAD_WINDOW - 1)) & 1 != 0;
        self.bits = (self.bits << 1) | busy as u128;

        if self.samples < LOAD_WINDOW as u16 {
            self.samples += 1;
        } else if evicted {
            self.busy -= 1;
        }
        if busy {
            self.busy += 1;
        }
    }

    /// Utilization over the window, in percent.
    pub(crate) fn percent(&self) -> u8 {
        if self.samples == 0 {
            0
        } else {
            (self.busy as u32 * 100 / self.samples as u32) as u8
        }
    }
}

// ---------------------------------------------------------------------------

pub(crate) struct SmpGlobals<Traits> {
    /// Round-robin placement cursor.
    rr_next: CpuLockCell<Traits, u8>,

    /// Lifetime number of balancer migrations.
    migrations: CpuLockCell<Traits, u32>,

    /// The tick of the most recent migration.
    last_migration: CpuLockCell<Traits, Option<Ticks>>,

    /// The tick of the most recent balancer pass.
    last_balance: CpuLockCell<Traits, Ticks>,
}

impl<Traits> Init for SmpGlobals<Traits> {
    const INIT: Self = Self {
        rr_next: Init::INIT,
        migrations: Init::INIT,
        last_migration: Init::INIT,
        last_balance: Init::INIT,
    };
}

/// Load balancer statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalancerStats {
    pub migrations: u32,
    pub last_migration: Option<Ticks>,
}

// ---------------------------------------------------------------------------
// Placement

/// Decide the core for an `Any`-affinity task. Pure so it can be tested in
/// isolation.
fn place(
    strategy: AssignmentStrategy,
    rr_cursor: u8,
    loads: [u8; 2],
    priority: Priority,
    priority_levels: usize,
) -> usize {
    let less_busy = if loads[1] < loads[0] { 1 } else { 0 };
    match strategy {
        AssignmentStrategy::RoundRobin => rr_cursor as usize % 2,
        AssignmentStrategy::LeastLoaded => less_busy,
        AssignmentStrategy::PriorityBased => {
            if (priority as usize) * 2 >= priority_levels {
                less_busy
            } else {
                1 - less_busy
            }
        }
    }
}

/// Choose and record the core whose ready queue a task about to become
/// Ready goes to.
pub(crate) fn assign_core_for_ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) -> usize {
    if Traits::NUM_CORES == 1 {
        return 0;
    }

    let state = Traits::state();
    let core = match task.affinity.get(&*lock) {
        Affinity::Core0 => 0,
        Affinity::Core1 => 1,
        Affinity::Any => {
            let strategy = state.cfg.read(&*lock).assignment_strategy;
            let rr = state.smp.rr_next.replace_with(&mut *lock, |x| x.wrapping_add(1));
            let loads = [
                state.core(0).load.read(&*lock).percent(),
                state.core(1).load.read(&*lock).percent(),
            ];
            place(
                strategy,
                rr,
                loads,
                task.effective_priority.get(&*lock),
                Traits::NUM_TASK_PRIORITY_LEVELS,
            )
        }
    };

    task.assigned_core.replace(&mut *lock, core as u8);
    core
}

// ---------------------------------------------------------------------------
// Per-tick sampling and balancing

/// Record one load sample per core. Called from the tick handler.
pub(crate) fn sample_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    for core in 0..Traits::NUM_CORES {
        let core_state = Traits::state().core(core);
        let busy = match core_state.running_task() {
            Some(task) => {
                let idle = core_state.idle_task.get(&*lock);
                !idle.map_or(false, |i| core::ptr::eq(i, task))
            }
            None => false,
        };
        core_state.load.write(&mut *lock).push(busy);
    }
}

/// Run a balancer pass if the configured period elapsed. Migrates at most
/// one task per pass.
pub(crate) fn balance_if_due<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    now: Ticks,
) {
    if Traits::NUM_CORES < 2 {
        return;
    }

    let state = Traits::state();
    let cfg = *state.cfg.read(&*lock);
    if cfg.load_balance_threshold == 0 {
        return;
    }
    if now.wrapping_sub(state.smp.last_balance.get(&*lock)) < cfg.load_balance_period {
        return;
    }
    state.smp.last_balance.replace(&mut *lock, now);

    let loads = [
        state.core(0).load.read(&*lock).percent(),
        state.core(1).load.read(&*lock).percent(),
    ];
    let (hot, cool) = if loads[0] >= loads[1] { (0, 1) } else { (1, 0) };
    if loads[hot] - loads[cool] < cfg.load_balance_threshold {
        return;
    }

    // Candidate: the lowest-priority Ready task on the hot core with `Any`
    // affinity that holds no mutex. A Ready task is at a safe point by
    // definition - it isn't running and its context is fully saved.
    let candidate = state.core(hot).ready.find_lowest_first(
        lock.borrow_mut(),
        |lock, task: TaskRef<Traits>| {
            task.affinity.get(&*lock) == Affinity::Any
                && task.last_mutex_held.read(&*lock).is_none()
        },
    );
    let Some(task) = candidate else { return };

    state.core(hot).ready.remove(lock.borrow_mut(), task);
    task.assigned_core.replace(&mut *lock, cool as u8);
    let prio = task.effective_priority.get(&*lock);
    state
        .core(cool)
        .ready
        .push_back_task(lock.borrow_mut(), task, prio);

    state
        .smp
        .migrations
        .replace_with(&mut *lock, |x| x.wrapping_add(1));
    state.smp.last_migration.replace(&mut *lock, Some(now));

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::Migration,
        crate::task::task_ref_to_id::<Traits>(task).get() as u32,
        cool as u32,
    );

    if cool != Traits::core_id() {
        // Safety: under CPU Lock
        unsafe { Traits::notify_core(cool) };
    }
}

// ---------------------------------------------------------------------------
// Public queries

pub(crate) fn core_load<Traits: KernelTraits>(core: usize) -> Result<u8, BadParamError> {
    if core >= Traits::NUM_CORES {
        return Err(BadParamError::BadParam);
    }
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => Ok(Traits::state().core(core).load.read(&*lock).percent()),
        Err(_) => Err(BadParamError::BadParam),
    }
}

pub(crate) fn balancer_stats<Traits: KernelTraits>() -> BalancerStats {
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => BalancerStats {
            migrations: Traits::state().smp.migrations.get(&*lock),
            last_migration: Traits::state().smp.last_migration.get(&*lock),
        },
        Err(_) => BalancerStats::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_masks() {
        assert!(Affinity::Any.allows(0) && Affinity::Any.allows(1));
        assert!(Affinity::Core0.allows(0) && !Affinity::Core0.allows(1));
        assert!(!Affinity::Core1.allows(0) && Affinity::Core1.allows(1));
        assert!(!Affinity::Core1.allows_any_of(1));
        assert!(Affinity::Core1.allows_any_of(2));
    }

    #[test]
    fn round_robin_alternates() {
        assert_eq!(place(AssignmentStrategy::RoundRobin, 0, [0, 0], 5, 32), 0);
        assert_eq!(place(AssignmentStrategy::RoundRobin, 1, [0, 0], 5, 32), 1);
        assert_eq!(place(AssignmentStrategy::RoundRobin, 2, [0, 0], 5, 32), 0);
    }

    #[test]
    fn least_loaded_picks_cooler_core() {
        assert_eq!(place(AssignmentStrategy::LeastLoaded, 0, [80, 10], 5, 32), 1);
        assert_eq!(place(AssignmentStrategy::LeastLoaded, 0, [10, 80], 5, 32), 0);
        // Ties go to core 0
        assert_eq!(place(AssignmentStrategy::LeastLoaded, 0, [50, 50], 5, 32), 0);
    }

    #[test]
    fn priority_based_splits_by_urgency() {
        // Urgent task goes to the less busy core
        assert_eq!(place(AssignmentStrategy::PriorityBased, 0, [90, 10], 30, 32), 1);
        // Bulk task goes to the other one
        assert_eq!(place(AssignmentStrategy::PriorityBased, 0, [90, 10], 2, 32), 0);
    }

    #[test]
    fn load_window_tracks_utilization() {
        let mut w = LoadWindow::INIT;
        assert_eq!(w.percent(), 0);

        for _ in 0..64 {
            w.push(true);
        }
        assert_eq!(w.percent(), 100);

        for _ in 0..64 {
            w.push(false);
        }
        assert_eq!(w.percent(), 50);

        // Saturate the window with idle samples; the busy ones fall out
        for _ in 0..LOAD_WINDOW {
            w.push(false);
        }
        assert_eq!(w.percent(), 0);
    }

    #[test]
    fn load_window_partial_fill() {
        let mut w = LoadWindow::INIT;
        w.push(true);
        w.push(false);
        assert_eq!(w.percent(), 50);
    }
}
