//! Single-flight bookkeeping for link operations.
//!
//! Pure state, no I/O and no timers of its own: the coordinator asks it what to do and
//! owns the actual sleep until [`RefreshScheduler::deadline`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Exponential retry delay, doubling after every failure up to a cap
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            current: start,
        }
    }

    /// The delay to wait now. The following call returns twice as much, capped.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.start;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    BackoffScheduled,
}

/// A unit of work on the link
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Job<C> {
    Refresh,
    Command(C),
}

/// What the scheduler decided after a job finished
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Transition<C> {
    Idle,
    /// Nothing queued, retry after the delay
    Backoff(Duration),
    /// Start this job right away
    Run(Job<C>),
}

/// At most one link operation at a time.
///
/// Refresh requests made while something runs collapse into a single trailing refresh.
/// Commands made while something runs queue up in order and run before that trailing
/// refresh.
pub(crate) struct RefreshScheduler<C> {
    phase: Phase,
    trailing_refresh: bool,
    pending: VecDeque<C>,
    backoff: Backoff,
    deadline: Option<Instant>,
}

impl<C> RefreshScheduler<C> {
    pub(crate) fn new(backoff: Backoff) -> Self {
        Self {
            phase: Phase::Idle,
            trailing_refresh: false,
            pending: VecDeque::new(),
            backoff,
            deadline: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// When the pending retry is due, if one is scheduled
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true when the caller should start a refresh now. A scheduled retry is
    /// preempted.
    pub(crate) fn request_refresh(&mut self) -> bool {
        if self.phase == Phase::Running {
            self.trailing_refresh = true;
            return false;
        }
        self.enter_running();
        true
    }

    /// Returns the command back when it should run now, keeps it queued otherwise.
    pub(crate) fn submit(&mut self, command: C) -> Option<C> {
        if self.phase == Phase::Running {
            self.pending.push_back(command);
            return None;
        }
        self.enter_running();
        Some(command)
    }

    /// The retry timer fired. Returns true when a refresh should start.
    pub(crate) fn backoff_elapsed(&mut self) -> bool {
        if self.phase != Phase::BackoffScheduled {
            return false;
        }
        self.enter_running();
        true
    }

    /// The running job is done.
    pub(crate) fn finish(&mut self, success: bool, now: Instant) -> Transition<C> {
        let retry = if success {
            self.backoff.reset();
            None
        } else {
            Some(self.backoff.next_delay())
        };

        if let Some(command) = self.pending.pop_front() {
            self.enter_running();
            return Transition::Run(Job::Command(command));
        }
        if std::mem::take(&mut self.trailing_refresh) {
            self.enter_running();
            return Transition::Run(Job::Refresh);
        }

        match retry {
            Some(delay) => {
                self.phase = Phase::BackoffScheduled;
                self.deadline = Some(now + delay);
                Transition::Backoff(delay)
            }
            None => {
                self.phase = Phase::Idle;
                Transition::Idle
            }
        }
    }

    /// Forget everything, handing back the commands that never ran.
    pub(crate) fn cancel(&mut self) -> Vec<C> {
        self.phase = Phase::Idle;
        self.trailing_refresh = false;
        self.deadline = None;
        self.pending.drain(..).collect()
    }

    fn enter_running(&mut self) {
        self.phase = Phase::Running;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn scheduler() -> RefreshScheduler<&'static str> {
        RefreshScheduler::new(Backoff::new(secs(3), secs(30)))
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(secs(3), secs(30));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, [secs(3), secs(6), secs(12), secs(24), secs(30), secs(30)]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), secs(3));
    }

    #[test]
    fn burst_of_requests_yields_one_trailing_refresh() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        assert!(scheduler.request_refresh());
        assert!(!scheduler.request_refresh());
        assert!(!scheduler.request_refresh());
        assert!(!scheduler.request_refresh());

        assert_eq!(scheduler.finish(true, now), Transition::Run(Job::Refresh));
        assert_eq!(scheduler.phase(), Phase::Running);
        assert_eq!(scheduler.finish(true, now), Transition::Idle);
        assert_eq!(scheduler.phase(), Phase::Idle);
    }

    #[test]
    fn failures_schedule_growing_retries() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        let mut delays = Vec::new();
        for _ in 0..5 {
            if scheduler.phase() == Phase::BackoffScheduled {
                assert!(scheduler.backoff_elapsed());
            } else {
                assert!(scheduler.request_refresh());
            }
            match scheduler.finish(false, now) {
                Transition::Backoff(delay) => delays.push(delay),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(scheduler.deadline(), Some(now + *delays.last().unwrap()));
        }
        assert_eq!(delays, [secs(3), secs(6), secs(12), secs(24), secs(30)]);

        // One success brings the delay back to the start
        assert!(scheduler.backoff_elapsed());
        assert_eq!(scheduler.finish(true, now), Transition::Idle);
        assert!(scheduler.request_refresh());
        assert_eq!(scheduler.finish(false, now), Transition::Backoff(secs(3)));
    }

    #[test]
    fn explicit_request_preempts_retry_timer() {
        let mut scheduler = scheduler();
        let now = Instant::now();
        assert!(scheduler.request_refresh());
        scheduler.finish(false, now);
        assert!(scheduler.deadline().is_some());

        assert!(scheduler.request_refresh());
        assert_eq!(scheduler.deadline(), None);
        // The timer firing late changes nothing while running
        assert!(!scheduler.backoff_elapsed());
    }

    #[test]
    fn commands_queue_in_order_before_trailing_refresh() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        assert!(scheduler.request_refresh());
        assert_eq!(scheduler.submit("on"), None);
        assert!(!scheduler.request_refresh());
        assert_eq!(scheduler.submit("off"), None);

        assert_eq!(scheduler.finish(true, now), Transition::Run(Job::Command("on")));
        assert_eq!(scheduler.finish(true, now), Transition::Run(Job::Command("off")));
        assert_eq!(scheduler.finish(true, now), Transition::Run(Job::Refresh));
        assert_eq!(scheduler.finish(true, now), Transition::Idle);

        assert_eq!(scheduler.submit("on"), Some("on"));
    }

    #[test]
    fn failure_with_queued_work_runs_it_immediately() {
        let mut scheduler = scheduler();
        let now = Instant::now();
        assert!(scheduler.request_refresh());
        assert!(!scheduler.request_refresh());

        assert_eq!(scheduler.finish(false, now), Transition::Run(Job::Refresh));
        assert_eq!(scheduler.deadline(), None);
        // The delay still grew
        assert_eq!(scheduler.finish(false, now), Transition::Backoff(secs(6)));
    }

    #[test]
    fn cancel_returns_unrun_commands() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.submit("on"), Some("on"));
        assert_eq!(scheduler.submit("off"), None);
        assert!(!scheduler.request_refresh());

        assert_eq!(scheduler.cancel(), vec!["off"]);
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert!(scheduler.request_refresh());
    }
}
