//! Timer facility consumed by the engine and driven by the event loop.
//!
//! The runtime owns the clock: it asks [`TimerService::next_timeout`] how long
//! to poll, then calls [`TimerService::run_expired`] with the current instant.
//! Tests drive a synthetic clock through the same two calls.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

type TimerTask = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    token: TimerToken,
    task: TimerTask,
    repeat: Option<Duration>,
}

#[derive(Default)]
struct Registrations {
    next_token: u64,
    // (deadline, token) keys keep same-instant timers distinct and ordered
    entries: BTreeMap<(Instant, u64), Entry>,
    deadlines: HashMap<u64, Instant>,
}

#[derive(Default)]
pub struct TimerService {
    inner: Mutex<Registrations>,
}

impl TimerService {
    pub fn new() -> TimerService {
        TimerService::default()
    }

    pub fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerToken {
        self.schedule(Instant::now() + delay, task, None)
    }

    pub fn schedule_repeating(&self, interval: Duration, task: TimerTask) -> TimerToken {
        self.schedule(Instant::now() + interval, task, Some(interval))
    }

    /// Returns false if the timer already fired or was never registered.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut inner = self.inner.lock();
        match inner.deadlines.remove(&token.0) {
            Some(deadline) => inner.entries.remove(&(deadline, token.0)).is_some(),
            None => false,
        }
    }

    /// Deadline of the earliest registered timer, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.inner
            .lock()
            .entries
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Fire every timer due at `now`, rescheduling repeating ones. Returns
    /// how many tasks ran. Tasks execute outside the registration lock so
    /// they can themselves schedule or cancel timers.
    pub fn run_expired(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some((&(deadline, token), _)) = inner.entries.iter().next() {
                if deadline > now {
                    break;
                }
                let entry = inner
                    .entries
                    .remove(&(deadline, token))
                    .filter(|_| inner.deadlines.remove(&token).is_some());
                if let Some(entry) = entry {
                    if let Some(interval) = entry.repeat {
                        let next = now + interval;
                        inner.deadlines.insert(entry.token.0, next);
                        inner.entries.insert(
                            (next, entry.token.0),
                            Entry {
                                token: entry.token,
                                task: entry.task.clone(),
                                repeat: Some(interval),
                            },
                        );
                    }
                    due.push(entry.task);
                }
            }
        }

        let fired = due.len();
        for task in due {
            task();
        }
        fired
    }

    fn schedule(&self, deadline: Instant, task: TimerTask, repeat: Option<Duration>) -> TimerToken {
        let mut inner = self.inner.lock();
        inner.next_token += 1;
        let token = TimerToken(inner.next_token);
        inner.deadlines.insert(token.0, deadline);
        inner.entries.insert(
            (deadline, token.0),
            Entry {
                token,
                task,
                repeat,
            },
        );
        token
    }
}

/// Per-connection timeout holder: one armed timer at a time, re-armed on
/// activity, cancelled on teardown.
pub struct TimeoutContainer {
    service: Arc<TimerService>,
    duration: Option<Duration>,
    token: Option<TimerToken>,
    task: TimerTask,
}

impl TimeoutContainer {
    pub fn new(service: Arc<TimerService>, duration: Duration, task: TimerTask) -> Self {
        let mut container = TimeoutContainer {
            service,
            duration: Some(duration),
            token: None,
            task,
        };
        container.reset();
        container
    }

    /// Holds a duration but stays unarmed until the first `reset`, for
    /// timeouts that only count while a condition lasts (buffered output).
    pub fn new_unarmed(service: Arc<TimerService>, duration: Duration, task: TimerTask) -> Self {
        TimeoutContainer {
            service,
            duration: Some(duration),
            token: None,
            task,
        }
    }

    /// Re-arm from now. Returns false when no duration is configured.
    pub fn reset(&mut self) -> bool {
        self.cancel();
        match self.duration {
            Some(duration) => {
                self.token = Some(self.service.schedule_once(duration, self.task.clone()));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            self.service.cancel(token);
        }
    }
}

impl Drop for TimeoutContainer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn once_fires_once() {
        let service = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        service.schedule_once(Duration::from_millis(5), counter_task(&fired));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(service.run_expired(later), 1);
        assert_eq!(service.run_expired(later + Duration::from_secs(1)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_reschedules() {
        let service = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        service.schedule_repeating(Duration::from_millis(10), counter_task(&fired));

        let mut now = Instant::now();
        for _ in 0..3 {
            now += Duration::from_millis(15);
            service.run_expired(now);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(service.next_timeout().is_some());
    }

    #[test]
    fn cancel_prevents_firing() {
        let service = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let token = service.schedule_once(Duration::from_millis(5), counter_task(&fired));

        assert!(service.cancel(token));
        assert!(!service.cancel(token));
        service.run_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn container_rearms_and_cancels() {
        let service = Arc::new(TimerService::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let mut container = TimeoutContainer::new(
            service.clone(),
            Duration::from_millis(10),
            counter_task(&fired),
        );

        assert!(container.reset());
        container.cancel();
        service.run_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        container.reset();
        service.run_expired(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
