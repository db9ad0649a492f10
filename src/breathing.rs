//! Box breathing and 5-4-3-2-1 grounding, as plain state machines.
//!
//! [`BreathingExercise`] only knows about phases and ticks. [`Breather`] drives
//! one from a worker thread at a fixed interval and hands phases to whoever
//! renders them; dropping it or calling [`CancelHandle::cancel`] stops the
//! timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

pub const PHASE_SECS: u64 = 4;
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreathPhase {
    Inhale,
    Hold,
    Exhale,
    Rest,
}

impl BreathPhase {
    pub fn next(self) -> Self {
        match self {
            BreathPhase::Inhale => BreathPhase::Hold,
            BreathPhase::Hold => BreathPhase::Exhale,
            BreathPhase::Exhale => BreathPhase::Rest,
            BreathPhase::Rest => BreathPhase::Inhale,
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            BreathPhase::Inhale => "Breathe in…",
            BreathPhase::Hold | BreathPhase::Rest => "Hold…",
            BreathPhase::Exhale => "Breathe out…",
        }
    }
}

/// Phase bookkeeping for one session. `None` phase means not started or
/// finished.
#[derive(Debug, Clone, Default)]
pub struct BreathingExercise {
    phase: Option<BreathPhase>,
    completed_cycles: u32,
    max_cycles: Option<u32>,
}

impl BreathingExercise {
    pub fn new(max_cycles: Option<u32>) -> Self {
        Self {
            phase: None,
            completed_cycles: 0,
            max_cycles,
        }
    }

    pub fn start(&mut self) -> BreathPhase {
        self.completed_cycles = 0;
        self.phase = Some(BreathPhase::Inhale);
        BreathPhase::Inhale
    }

    /// Advances one phase. Returns `None` once the requested number of
    /// cycles has been breathed, or if the exercise was never started.
    pub fn tick(&mut self) -> Option<BreathPhase> {
        let current = self.phase?;
        if current == BreathPhase::Rest {
            self.completed_cycles += 1;
            if self.max_cycles.is_some_and(|max| self.completed_cycles >= max) {
                self.phase = None;
                return None;
            }
        }
        let next = current.next();
        self.phase = Some(next);
        Some(next)
    }

    pub fn stop(&mut self) {
        self.phase = None;
    }

    pub fn phase(&self) -> Option<BreathPhase> {
        self.phase
    }

    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running exercise. Phases arrive on [`Breather::phases`]; the channel
/// disconnects when the exercise ends or is cancelled.
pub struct Breather {
    cancel: CancelHandle,
    phases: Receiver<BreathPhase>,
    worker: Option<JoinHandle<()>>,
}

impl Breather {
    pub fn start(interval: Duration, max_cycles: Option<u32>) -> Self {
        let cancel = CancelHandle::default();
        let (tx, rx) = mpsc::channel();
        let flag = cancel.clone();
        let worker = thread::spawn(move || {
            let mut exercise = BreathingExercise::new(max_cycles);
            let mut phase = exercise.start();
            loop {
                if tx.send(phase).is_err() || !sleep_unless_cancelled(&flag, interval) {
                    break;
                }
                match exercise.tick() {
                    Some(next) => phase = next,
                    None => break,
                }
            }
            debug!(cycles = exercise.completed_cycles(), "breathing exercise ended");
        });
        Self {
            cancel,
            phases: rx,
            worker: Some(worker),
        }
    }

    pub fn phases(&self) -> &Receiver<BreathPhase> {
        &self.phases
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Breather {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps for `total`, waking early on cancel. Returns `false` if cancelled.
fn sleep_unless_cancelled(flag: &CancelHandle, total: Duration) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if flag.is_cancelled() {
            return false;
        }
        let step = left.min(CANCEL_POLL);
        thread::sleep(step);
        left -= step;
    }
    !flag.is_cancelled()
}

pub const GROUNDING_STEPS: [&str; 5] = [
    "Name 5 things you can see.",
    "Name 4 things you can touch.",
    "Name 3 things you can hear.",
    "Name 2 things you can smell.",
    "Name 1 thing you can taste.",
];

/// Walks the grounding prompts, wrapping back to the first after the last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Grounding {
    step: usize,
}

impl Grounding {
    pub fn prompt(&self) -> &'static str {
        GROUNDING_STEPS[self.step]
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn is_last(&self) -> bool {
        self.step == GROUNDING_STEPS.len() - 1
    }

    pub fn action_label(&self) -> &'static str {
        if self.is_last() { "Start again" } else { "Next" }
    }

    pub fn advance(&mut self) -> &'static str {
        self.step = (self.step + 1) % GROUNDING_STEPS.len();
        self.prompt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_cycle_in_order() {
        let mut ex = BreathingExercise::new(None);
        assert_eq!(ex.start(), BreathPhase::Inhale);
        let seen: Vec<_> = (0..5).filter_map(|_| ex.tick()).collect();
        assert_eq!(
            seen,
            vec![
                BreathPhase::Hold,
                BreathPhase::Exhale,
                BreathPhase::Rest,
                BreathPhase::Inhale,
                BreathPhase::Hold,
            ]
        );
        assert_eq!(ex.completed_cycles(), 1);
    }

    #[test]
    fn bounded_exercise_finishes_after_its_cycles() {
        let mut ex = BreathingExercise::new(Some(1));
        ex.start();
        assert_eq!(ex.tick(), Some(BreathPhase::Hold));
        assert_eq!(ex.tick(), Some(BreathPhase::Exhale));
        assert_eq!(ex.tick(), Some(BreathPhase::Rest));
        assert_eq!(ex.tick(), None);
        assert_eq!(ex.phase(), None);
    }

    #[test]
    fn unstarted_or_stopped_exercise_does_not_tick() {
        let mut ex = BreathingExercise::default();
        assert_eq!(ex.tick(), None);
        ex.start();
        ex.stop();
        assert_eq!(ex.tick(), None);
    }

    #[test]
    fn breather_emits_one_cycle_then_disconnects() {
        let breather = Breather::start(Duration::from_millis(1), Some(1));
        let phases: Vec<_> = breather.phases().iter().collect();
        assert_eq!(
            phases,
            vec![
                BreathPhase::Inhale,
                BreathPhase::Hold,
                BreathPhase::Exhale,
                BreathPhase::Rest,
            ]
        );
        breather.stop();
    }

    #[test]
    fn cancel_stops_the_timer() {
        let breather = Breather::start(Duration::from_secs(60), None);
        assert_eq!(breather.phases().recv().unwrap(), BreathPhase::Inhale);
        breather.cancel_handle().cancel();
        assert!(breather.phases().recv().is_err());
        breather.stop();
    }

    #[test]
    fn grounding_wraps_after_the_last_step() {
        let mut g = Grounding::default();
        assert_eq!(g.prompt(), GROUNDING_STEPS[0]);
        for _ in 0..4 {
            g.advance();
        }
        assert!(g.is_last());
        assert_eq!(g.action_label(), "Start again");
        assert_eq!(g.advance(), GROUNDING_STEPS[0]);
        assert_eq!(g.step(), 0);
    }
}
