use std::cell::Cell;
use std::time::{Duration, Instant};

/// Default debounce delay for deferred recompute requests.
pub const DEFAULT_DELAYED_MANAGE_TIMEOUT: Duration = Duration::from_millis(67);

/// Urgency of a recompute request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScheduleTime {
    /// Run on the next drain of the task queue.
    Now,
    /// Run once the debounce timer expires; repeated requests coalesce.
    Later,
}

/// Handle for an armed debounce timer.
///
/// Hosts that own a real timer primitive arm it for `deadline` and hand the
/// token back when it fires. A token whose generation no longer matches the
/// scheduler's was cancelled and must be ignored.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TimerToken {
    pub generation: u64,
    pub deadline: Instant,
}

/// Coalesces "now" and "later" recompute requests into at most one pending pass.
///
/// The scheduler never runs anything itself. Its owner asks whether a pass is
/// due (`is_due`) or whether a fired timer is still current (`is_current`),
/// and calls [`ManageScheduler::begin_pass`] before doing the work.
#[derive(Debug)]
pub struct ManageScheduler {
    delay: Duration,
    immediate: Cell<bool>,
    timer: Cell<Option<TimerToken>>,
    generation: Cell<u64>,
}

impl ManageScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            immediate: Cell::new(false),
            timer: Cell::new(None),
            generation: Cell::new(0),
        }
    }

    /// Debounce delay applied to [`ScheduleTime::Later`] requests.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records a recompute request. Returns `true` if new work was scheduled.
    pub fn schedule(&self, when: ScheduleTime) -> bool {
        self.schedule_at(when, Instant::now())
    }

    /// Same as [`ManageScheduler::schedule`] with an explicit clock reading.
    pub fn schedule_at(&self, when: ScheduleTime, now: Instant) -> bool {
        // A pending immediate pass already covers any further request.
        if self.immediate.get() {
            return false;
        }

        match when {
            ScheduleTime::Now => {
                self.immediate.set(true);
                self.cancel_timer();
                #[cfg(feature = "diagnostics")]
                log::trace!("recompute scheduled now");
                true
            }
            ScheduleTime::Later => {
                if self.timer.get().is_some() {
                    return false;
                }
                let generation = self.generation.get().wrapping_add(1);
                self.generation.set(generation);
                self.timer.set(Some(TimerToken {
                    generation,
                    deadline: now + self.delay,
                }));
                #[cfg(feature = "diagnostics")]
                log::trace!("recompute scheduled in {:?} (generation {generation})", self.delay);
                true
            }
        }
    }

    /// Disarms a pending debounce timer, invalidating its token.
    pub fn cancel_timer(&self) {
        if self.timer.take().is_some() {
            self.generation.set(self.generation.get().wrapping_add(1));
        }
    }

    /// Clears every pending request. Called at the start of a recompute pass.
    pub fn begin_pass(&self) {
        self.immediate.set(false);
        self.cancel_timer();
    }

    pub fn is_immediate_scheduled(&self) -> bool {
        self.immediate.get()
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer.get().is_some()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_immediate_scheduled() && !self.is_timer_armed()
    }

    /// Returns the armed timer, if any.
    pub fn pending_timer(&self) -> Option<TimerToken> {
        self.timer.get()
    }

    /// Returns `true` if `token` belongs to the currently armed timer.
    pub fn is_current(&self, token: TimerToken) -> bool {
        self.timer.get() == Some(token)
    }

    /// Returns `true` if a pass should run at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.immediate.get() {
            return true;
        }
        self.timer
            .get()
            .map(|timer| now >= timer.deadline)
            .unwrap_or(false)
    }

    /// Earliest instant at which a pass becomes due.
    ///
    /// An immediate request reports `now`, so event loops poll without sleeping.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if self.immediate.get() {
            return Some(now);
        }
        self.timer.get().map(|timer| timer.deadline)
    }
}

impl Default for ManageScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYED_MANAGE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_requests_coalesce_into_one_timer() {
        let scheduler = ManageScheduler::default();
        let now = Instant::now();

        assert!(scheduler.schedule_at(ScheduleTime::Later, now));
        let first = scheduler.pending_timer().unwrap();
        assert!(!scheduler.schedule_at(ScheduleTime::Later, now + Duration::from_millis(10)));
        assert_eq!(scheduler.pending_timer(), Some(first));
        assert_eq!(first.deadline, now + DEFAULT_DELAYED_MANAGE_TIMEOUT);
    }

    #[test]
    fn now_cancels_pending_timer() {
        let scheduler = ManageScheduler::default();
        let now = Instant::now();

        scheduler.schedule_at(ScheduleTime::Later, now);
        let token = scheduler.pending_timer().unwrap();
        assert!(scheduler.schedule_at(ScheduleTime::Now, now));

        assert!(scheduler.is_immediate_scheduled());
        assert!(!scheduler.is_timer_armed());
        assert!(!scheduler.is_current(token));
    }

    #[test]
    fn later_never_preempts_now() {
        let scheduler = ManageScheduler::default();
        let now = Instant::now();

        scheduler.schedule_at(ScheduleTime::Now, now);
        assert!(!scheduler.schedule_at(ScheduleTime::Later, now));
        assert!(!scheduler.schedule_at(ScheduleTime::Now, now));
        assert!(!scheduler.is_timer_armed());
    }

    #[test]
    fn timer_becomes_due_at_deadline() {
        let scheduler = ManageScheduler::new(Duration::from_millis(100));
        let now = Instant::now();

        scheduler.schedule_at(ScheduleTime::Later, now);
        assert!(!scheduler.is_due(now + Duration::from_millis(99)));
        assert!(scheduler.is_due(now + Duration::from_millis(100)));
        assert_eq!(scheduler.next_deadline(now), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn begin_pass_clears_everything_and_stales_tokens() {
        let scheduler = ManageScheduler::default();
        let now = Instant::now();

        scheduler.schedule_at(ScheduleTime::Later, now);
        let token = scheduler.pending_timer().unwrap();
        scheduler.begin_pass();

        assert!(scheduler.is_idle());
        assert!(!scheduler.is_current(token));
        assert_eq!(scheduler.next_deadline(now), None);

        // A re-armed timer gets a fresh generation even with the same deadline.
        scheduler.schedule_at(ScheduleTime::Later, now);
        let rearmed = scheduler.pending_timer().unwrap();
        assert_ne!(rearmed.generation, token.generation);
        assert!(!scheduler.is_current(token));
    }
}
