//! Per-solver timing context.
//!
//! Each [`Solver`](crate::solver::Solver) owns one [`Timings`]; nothing is
//! process-global, so several solvers in one process never mix their numbers.

use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct Timer {
    count: u64,
    total: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the interval opened by [`start`](Self::start); unmatched stops are ignored.
    pub fn stop(&mut self) {
        if let Some(t0) = self.started.take() {
            self.total += t0.elapsed();
            self.count += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(c) => self.total / c,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Compute,
    Communicate,
    Reduce,
}

/// Compute / communicate / reduce timers; inert unless enabled.
#[derive(Clone, Debug, Default)]
pub struct Timings {
    enabled: bool,
    compute: Timer,
    communicate: Timer,
    reduce: Timer,
}

impl Timings {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn timer(&self, phase: Phase) -> &Timer {
        match phase {
            Phase::Compute => &self.compute,
            Phase::Communicate => &self.communicate,
            Phase::Reduce => &self.reduce,
        }
    }

    fn timer_mut(&mut self, phase: Phase) -> &mut Timer {
        match phase {
            Phase::Compute => &mut self.compute,
            Phase::Communicate => &mut self.communicate,
            Phase::Reduce => &mut self.reduce,
        }
    }

    #[inline]
    pub fn start(&mut self, phase: Phase) {
        if self.enabled {
            self.timer_mut(phase).start();
        }
    }

    #[inline]
    pub fn stop(&mut self, phase: Phase) {
        if self.enabled {
            self.timer_mut(phase).stop();
        }
    }

    pub fn reset(&mut self) {
        self.compute.reset();
        self.communicate.reset();
        self.reduce.reset();
    }

    pub fn report(&self, rank: usize) {
        if !self.enabled {
            return;
        }
        for (name, t) in [
            ("t_compute", &self.compute),
            ("t_communicate", &self.communicate),
            ("t_reduce", &self.reduce),
        ] {
            log::info!(
                "{rank}: {name} {} av.time {:.6}",
                t.count(),
                t.average().as_secs_f64()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_timings_record_nothing() {
        let mut t = Timings::new(false);
        t.start(Phase::Compute);
        t.stop(Phase::Compute);
        assert_eq!(t.timer(Phase::Compute).count(), 0);
    }

    #[test]
    fn intervals_accumulate_and_reset() {
        let mut t = Timings::new(true);
        for _ in 0..3 {
            t.start(Phase::Reduce);
            t.stop(Phase::Reduce);
        }
        t.stop(Phase::Reduce);
        assert_eq!(t.timer(Phase::Reduce).count(), 3);
        assert!(t.timer(Phase::Reduce).average() <= t.timer(Phase::Reduce).total());
        t.reset();
        assert_eq!(t.timer(Phase::Reduce).count(), 0);
        assert_eq!(t.timer(Phase::Reduce).average(), Duration::ZERO);
    }
}
