//! Dual-rate event ticker.
//!
//! The scheduler sleeps exactly as long as needed for the next periodic
//! source to become due. Sources due within `time_window` of the wake-up are
//! reported together, so a source may fire up to `time_window` early in
//! exchange for fewer wake-ups.
//!
//! Each source keeps its own cadence: its next fire time is advanced by its
//! interval, not recomputed from the wake time. When the loop stalls for
//! longer than an interval the missed ticks are skipped (the source fires
//! once and then realigns to its original phase) instead of being replayed
//! as a burst.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Intervals are never shorter than this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Time source for the scheduler.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock time and a real `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A clock that only moves when told to. Sleeping advances it instantly.
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    /// Time passed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// The periodic sources the console runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Keyboard responsiveness.
    Heartbeat,
    /// Device polling.
    Measurement,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Heartbeat, Source::Measurement];

    fn index(self) -> usize {
        self as usize
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// The set of sources reported by one [`IntervalScheduler::next`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fired(u8);

impl Fired {
    pub fn contains(&self, source: Source) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Source> + '_ {
        Source::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    fn insert(&mut self, source: Source) {
        self.0 |= source.bit();
    }
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    interval: Duration,
    next_fire: Instant,
}

pub struct IntervalScheduler<C: Clock = SystemClock> {
    clock: C,
    sources: [Schedule; 2],
    time_window: Duration,
}

impl<C: Clock> IntervalScheduler<C> {
    /// Creates a scheduler whose sources first fire one interval from now.
    pub fn new(clock: C, heartbeat: Duration, measurement: Duration, time_window: Duration) -> Self {
        let now = clock.now();
        let schedule = |interval: Duration| {
            let interval = interval.max(MIN_INTERVAL);
            Schedule {
                interval,
                next_fire: now + interval,
            }
        };
        Self {
            sources: [schedule(heartbeat), schedule(measurement)],
            clock,
            time_window,
        }
    }

    /// Reschedules every source one interval from now.
    pub fn restart(&mut self) {
        let now = self.clock.now();
        for s in self.sources.iter_mut() {
            s.next_fire = now + s.interval;
        }
    }

    pub fn interval(&self, source: Source) -> Duration {
        self.sources[source.index()].interval
    }

    /// Changes a source's interval. The fire time already scheduled is kept;
    /// the new interval applies from the next reschedule on.
    pub fn set_interval(&mut self, source: Source, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        debug!(?source, ?interval, "interval changed");
        self.sources[source.index()].interval = interval;
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    /// When the given source is due next.
    pub fn next_fire(&self, source: Source) -> Instant {
        self.sources[source.index()].next_fire
    }

    /// Sleeps until the earliest source is due and returns every source that
    /// is due by the wake-up or within the time window after it. Fired
    /// sources are rescheduled.
    pub fn next(&mut self) -> Fired {
        let due = self
            .sources
            .iter()
            .fold(self.sources[0].next_fire, |due, s| due.min(s.next_fire));
        let now = self.clock.now();
        if due > now {
            self.clock.sleep(due - now);
        }

        let wake = self.clock.now();
        let trigger = wake + self.time_window;
        let mut fired = Fired::default();
        for source in Source::ALL {
            let s = &mut self.sources[source.index()];
            if s.next_fire > wake && s.next_fire >= trigger {
                continue;
            }
            fired.insert(source);
            s.next_fire += s.interval;
            if s.next_fire <= wake {
                let behind = wake - s.next_fire;
                let skipped = (behind.as_nanos() / s.interval.as_nanos()) as u32 + 1;
                s.next_fire += s.interval * skipped;
                debug!(?source, skipped, "loop stalled, skipping ticks");
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn scheduler(hb: f64, meas: f64, window: f64) -> (IntervalScheduler<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let sched = IntervalScheduler::new(clock.clone(), secs(hb), secs(meas), secs(window));
        (sched, clock)
    }

    #[test]
    fn every_source_fires_once_per_interval() {
        let (mut sched, clock) = scheduler(1.0, 3.0, 0.01);
        let mut heartbeats = 0;
        let mut measurements = Vec::new();
        for _ in 0..12 {
            let fired = sched.next();
            assert!(fired.contains(Source::Heartbeat));
            heartbeats += 1;
            if fired.contains(Source::Measurement) {
                measurements.push(clock.elapsed());
            }
        }
        assert_eq!(heartbeats, 12);
        assert_eq!(clock.elapsed(), secs(12.0));
        assert_eq!(measurements, vec![secs(3.0), secs(6.0), secs(9.0), secs(12.0)]);
    }

    #[test]
    fn near_simultaneous_sources_fire_together() {
        let (mut sched, clock) = scheduler(1.0, 1.005, 0.01);
        let fired = sched.next();
        assert!(fired.contains(Source::Heartbeat));
        assert!(fired.contains(Source::Measurement));
        assert_eq!(fired.iter().count(), 2);
        assert_eq!(clock.elapsed(), secs(1.0));
    }

    #[test]
    fn sources_outside_window_fire_separately() {
        let (mut sched, clock) = scheduler(1.0, 1.005, 0.001);
        let fired = sched.next();
        assert!(fired.contains(Source::Heartbeat));
        assert!(!fired.contains(Source::Measurement));

        let fired = sched.next();
        assert_eq!(fired.iter().collect::<Vec<_>>(), vec![Source::Measurement]);
        assert_eq!(clock.elapsed(), secs(1.005));
    }

    #[test]
    fn early_fire_keeps_own_cadence() {
        let (mut sched, clock) = scheduler(1.0, 1.15, 0.2);
        let start = clock.now();
        // Measurement fires 150ms early with the heartbeat, but its next fire
        // is still one interval after its scheduled time.
        let fired = sched.next();
        assert!(fired.contains(Source::Measurement));
        assert_eq!(clock.elapsed(), secs(1.0));
        assert_eq!(sched.next_fire(Source::Measurement), start + secs(1.15) * 2);
    }

    #[test]
    fn interval_change_keeps_scheduled_fire_time() {
        let (mut sched, clock) = scheduler(1.0, 10.0, 0.0);
        let scheduled = sched.next_fire(Source::Measurement);
        sched.set_interval(Source::Measurement, secs(2.0));
        assert_eq!(sched.interval(Source::Measurement), secs(2.0));
        assert_eq!(sched.next_fire(Source::Measurement), scheduled);

        while !sched.next().contains(Source::Measurement) {}
        assert_eq!(clock.elapsed(), secs(10.0));

        while !sched.next().contains(Source::Measurement) {}
        assert_eq!(clock.elapsed(), secs(12.0));
    }

    #[test]
    fn stalled_loop_skips_missed_ticks() {
        let (mut sched, clock) = scheduler(1.0, 10.0, 0.0);
        clock.advance(secs(3.5));

        let fired = sched.next();
        assert!(fired.contains(Source::Heartbeat));
        assert_eq!(clock.elapsed(), secs(3.5));
        // Realigned to the original phase instead of replaying 2s and 3s.
        assert_eq!(sched.next_fire(Source::Heartbeat) - clock.now(), secs(0.5));

        let fired = sched.next();
        assert!(fired.contains(Source::Heartbeat));
        assert_eq!(clock.elapsed(), secs(4.0));
    }

    #[test]
    fn restart_reschedules_from_now() {
        let (mut sched, clock) = scheduler(1.0, 10.0, 0.0);
        clock.advance(secs(5.0));
        sched.restart();
        assert_eq!(sched.next_fire(Source::Heartbeat), clock.now() + secs(1.0));
        assert_eq!(sched.next_fire(Source::Measurement), clock.now() + secs(10.0));
        sched.next();
        assert_eq!(clock.elapsed(), secs(6.0));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let (mut sched, _clock) = scheduler(1.0, 10.0, 0.0);
        sched.set_interval(Source::Heartbeat, Duration::ZERO);
        assert_eq!(sched.interval(Source::Heartbeat), MIN_INTERVAL);
    }
}
