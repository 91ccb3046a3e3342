//! Scoped, restorable per-phase deadline budgets.
//!
//! A connection carries three independent timeout values (connect, read,
//! write). Operations attach a budget through scope guards:
//!
//! - [`TimeoutSetter`] saves the prior value for a phase, applies an
//!   override, and restores the prior value when dropped, on every exit
//!   path including early `?` returns and future cancellation.
//! - [`TimeoutController`] additionally tracks elapsed wall time so a
//!   logical operation spanning several suspend/resume cycles (a proxy
//!   negotiation, a framed read) consumes one overall deadline instead of
//!   resetting the clock at each step.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Smallest deadline the timer subsystem is asked to arm. A residual
/// budget below this is treated as already expired.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// A phase's timeout value.
///
/// `Disabled` and `Infinite` are distinct variants on purpose: the former
/// means "no deadline configured", the latter "wait forever by request".
/// Both arm no timer. There is no magic zero; "keep the existing value"
/// is expressed by passing `None` where an `Option<TimeoutValue>` is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutValue {
    Disabled,
    Infinite,
    Finite(Duration),
}

impl TimeoutValue {
    /// The duration to arm, or `None` when no timer should be armed.
    pub fn deadline(self) -> Option<Duration> {
        match self {
            TimeoutValue::Finite(d) => Some(d),
            _ => None,
        }
    }

    /// Compatibility mapping for second-valued knobs: negative means
    /// infinite, zero means disabled, positive is a finite budget.
    pub fn from_secs_f64(v: f64) -> Self {
        if v < 0.0 {
            TimeoutValue::Infinite
        } else if v == 0.0 {
            TimeoutValue::Disabled
        } else {
            TimeoutValue::Finite(Duration::from_secs_f64(v))
        }
    }
}

/// Which timeout value(s) an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Read,
    Write,
    ReadWrite,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Connect = 0,
    Read = 1,
    Write = 2,
}

impl Phase {
    pub(crate) fn slots(self) -> &'static [Slot] {
        match self {
            Phase::Connect => &[Slot::Connect],
            Phase::Read => &[Slot::Read],
            Phase::Write => &[Slot::Write],
            Phase::ReadWrite => &[Slot::Read, Slot::Write],
            Phase::All => &[Slot::Connect, Slot::Read, Slot::Write],
        }
    }
}

/// The three timeout slots of one connection. Shared with scope guards
/// through an `Arc` so restoration works regardless of how the guarded
/// operation exits.
#[derive(Debug)]
pub struct TimeoutTable {
    slots: [Mutex<TimeoutValue>; 3],
}

impl TimeoutTable {
    pub fn new(connect: TimeoutValue, read: TimeoutValue, write: TimeoutValue) -> Self {
        Self {
            slots: [Mutex::new(connect), Mutex::new(read), Mutex::new(write)],
        }
    }

    pub(crate) fn get(&self, slot: Slot) -> TimeoutValue {
        *self.slots[slot as usize].lock().unwrap()
    }

    pub(crate) fn set_slot(&self, slot: Slot, value: TimeoutValue) {
        *self.slots[slot as usize].lock().unwrap() = value;
    }

    /// Apply `value` to every slot the phase covers.
    pub fn set(&self, value: TimeoutValue, phase: Phase) {
        for slot in phase.slots() {
            self.set_slot(*slot, value);
        }
    }

    /// The effective value for a phase (its first slot, mirroring the
    /// connect → read → write precedence of composite phases).
    pub fn get_phase(&self, phase: Phase) -> TimeoutValue {
        self.get(phase.slots()[0])
    }

    pub(crate) fn snapshot(&self) -> (TimeoutValue, TimeoutValue, TimeoutValue) {
        (
            self.get(Slot::Connect),
            self.get(Slot::Read),
            self.get(Slot::Write),
        )
    }
}

/// Scope guard: apply a timeout override for one phase, restore the prior
/// values on drop.
pub struct TimeoutSetter {
    table: Arc<TimeoutTable>,
    saved: Vec<(Slot, TimeoutValue)>,
}

impl TimeoutSetter {
    /// `requested == None` keeps the existing values (the guard still
    /// restores them, which is then a no-op).
    pub fn new(table: Arc<TimeoutTable>, requested: Option<TimeoutValue>, phase: Phase) -> Self {
        let mut saved = Vec::with_capacity(phase.slots().len());
        for slot in phase.slots() {
            let prior = table.get(*slot);
            saved.push((*slot, prior));
            if let Some(v) = requested {
                if v != prior {
                    table.set_slot(*slot, v);
                }
            }
        }
        Self { table, saved }
    }
}

impl Drop for TimeoutSetter {
    fn drop(&mut self) {
        for (slot, prior) in &self.saved {
            self.table.set_slot(*slot, *prior);
        }
    }
}

/// A [`TimeoutSetter`] that also accounts elapsed time, so one logical
/// operation keeps a single deadline across several underlying waits.
///
/// Call [`has_timedout`](Self::has_timedout) before each suspend: it
/// reports `true` once the residual budget drops below [`MIN_TICK`], and
/// otherwise re-arms the phase with the residual so the next wait uses
/// the correct remaining deadline.
pub struct TimeoutController {
    _setter: TimeoutSetter,
    table: Arc<TimeoutTable>,
    phase: Phase,
    budget: TimeoutValue,
    started: Option<Instant>,
}

impl TimeoutController {
    pub fn start(table: Arc<TimeoutTable>, budget: TimeoutValue, phase: Phase) -> Self {
        let setter = TimeoutSetter::new(table.clone(), Some(budget), phase);
        let started = matches!(budget, TimeoutValue::Finite(_)).then(Instant::now);
        Self {
            _setter: setter,
            table,
            phase,
            budget,
            started,
        }
    }

    pub fn has_timedout(&self) -> bool {
        if let (TimeoutValue::Finite(total), Some(t0)) = (self.budget, self.started) {
            let remaining = total.saturating_sub(t0.elapsed());
            if remaining < MIN_TICK {
                return true;
            }
            self.table.set(TimeoutValue::Finite(remaining), self.phase);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<TimeoutTable> {
        Arc::new(TimeoutTable::new(
            TimeoutValue::Finite(Duration::from_secs(1)),
            TimeoutValue::Infinite,
            TimeoutValue::Infinite,
        ))
    }

    #[test]
    fn from_secs_f64_mapping() {
        assert_eq!(TimeoutValue::from_secs_f64(-1.0), TimeoutValue::Infinite);
        assert_eq!(TimeoutValue::from_secs_f64(0.0), TimeoutValue::Disabled);
        assert_eq!(
            TimeoutValue::from_secs_f64(1.5),
            TimeoutValue::Finite(Duration::from_millis(1500))
        );
    }

    #[test]
    fn phase_slot_coverage() {
        let t = table();
        t.set(TimeoutValue::Finite(Duration::from_secs(7)), Phase::ReadWrite);
        assert_eq!(
            t.get(Slot::Read),
            TimeoutValue::Finite(Duration::from_secs(7))
        );
        assert_eq!(
            t.get(Slot::Write),
            TimeoutValue::Finite(Duration::from_secs(7))
        );
        // Connect untouched by ReadWrite.
        assert_eq!(
            t.get(Slot::Connect),
            TimeoutValue::Finite(Duration::from_secs(1))
        );

        t.set(TimeoutValue::Disabled, Phase::All);
        assert_eq!(t.snapshot().0, TimeoutValue::Disabled);
        assert_eq!(t.snapshot().1, TimeoutValue::Disabled);
        assert_eq!(t.snapshot().2, TimeoutValue::Disabled);
    }

    #[test]
    fn setter_restores_on_drop() {
        let t = table();
        {
            let _guard = TimeoutSetter::new(
                t.clone(),
                Some(TimeoutValue::Finite(Duration::from_millis(50))),
                Phase::Read,
            );
            assert_eq!(
                t.get(Slot::Read),
                TimeoutValue::Finite(Duration::from_millis(50))
            );
        }
        assert_eq!(t.get(Slot::Read), TimeoutValue::Infinite);
    }

    #[test]
    fn setter_restores_on_early_return() {
        let t = table();
        fn guarded(t: &Arc<TimeoutTable>) -> Result<(), ()> {
            let _guard = TimeoutSetter::new(
                t.clone(),
                Some(TimeoutValue::Finite(Duration::from_millis(10))),
                Phase::Write,
            );
            Err(())
        }
        assert!(guarded(&t).is_err());
        assert_eq!(t.get(Slot::Write), TimeoutValue::Infinite);
    }

    #[test]
    fn setter_none_keeps_values() {
        let t = table();
        let _guard = TimeoutSetter::new(t.clone(), None, Phase::Read);
        assert_eq!(t.get(Slot::Read), TimeoutValue::Infinite);
    }

    #[test]
    fn controller_expires_after_budget() {
        let t = table();
        let ctl = TimeoutController::start(
            t.clone(),
            TimeoutValue::Finite(Duration::from_millis(20)),
            Phase::Read,
        );
        assert!(!ctl.has_timedout());
        std::thread::sleep(Duration::from_millis(30));
        assert!(ctl.has_timedout());
    }

    #[test]
    fn controller_rearms_residual() {
        let t = table();
        let ctl = TimeoutController::start(
            t.clone(),
            TimeoutValue::Finite(Duration::from_secs(10)),
            Phase::Read,
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(!ctl.has_timedout());
        match t.get(Slot::Read) {
            TimeoutValue::Finite(d) => {
                assert!(d <= Duration::from_secs(10));
                assert!(d > Duration::from_secs(9));
            }
            other => panic!("expected finite residual, got {other:?}"),
        }
        drop(ctl);
        assert_eq!(t.get(Slot::Read), TimeoutValue::Infinite);
    }

    #[test]
    fn controller_infinite_never_expires() {
        let t = table();
        let ctl = TimeoutController::start(t.clone(), TimeoutValue::Infinite, Phase::Write);
        assert!(!ctl.has_timedout());
        assert_eq!(t.get(Slot::Write), TimeoutValue::Infinite);
    }
}
