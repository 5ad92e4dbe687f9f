//! Deadline enforcement for evaluations that cannot be preempted.
//!
//! The watchdog never interrupts anything itself. When a deadline passes
//! it publishes a `timeout` event and asks the policy callback whether to
//! keep waiting; `false` schedules another check one interval later,
//! `true` gives up on the evaluation and hands control to the abandon hook.
//! While the evaluation is waiting for input the deadline is suspended, and
//! resuming always starts a fresh full-length interval.

use crate::event_bus::EventBus;
use crate::protocol::TIMEOUT;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type TimeoutPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Check interval and the predicate consulted on every missed deadline.
#[derive(Clone)]
pub struct TimeoutPolicy {
    pub time: Duration,
    pub callback: TimeoutPredicate,
    /// Give up after this many missed deadlines of one evaluation, whatever
    /// the predicate says.
    pub max_checks: Option<u32>,
}

impl TimeoutPolicy {
    pub fn new<F>(time: Duration, callback: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            time,
            callback: Arc::new(callback),
            max_checks: None,
        }
    }

    /// Give up after `max_checks` missed deadlines.
    pub fn max_checks(time: Duration, max_checks: u32) -> Self {
        Self {
            max_checks: Some(max_checks),
            ..Self::new(time, || false)
        }
    }

    fn gives_up(&self, checks: u32) -> bool {
        let asked = (self.callback)();
        asked || self.max_checks.is_some_and(|max| checks >= max)
    }
}

impl std::fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("time", &self.time)
            .field("max_checks", &self.max_checks)
            .finish_non_exhaustive()
    }
}

pub type AbandonHook = Box<dyn FnOnce(u32) + Send>;

#[derive(Default)]
struct WatchdogState {
    generation: u64,
    deadline: Option<Instant>,
    waiting_on_input: bool,
    checks: u32,
    timer: Option<JoinHandle<()>>,
    on_abandon: Option<AbandonHook>,
}

impl WatchdogState {
    fn stop_timer(&mut self) {
        self.generation += 1;
        self.deadline = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Cheap to clone; clones drive the same timer.
#[derive(Clone)]
pub struct Watchdog {
    bus: EventBus,
    policy: TimeoutPolicy,
    state: Arc<Mutex<WatchdogState>>,
}

impl Watchdog {
    pub fn new(bus: EventBus, policy: TimeoutPolicy) -> Self {
        Self {
            bus,
            policy,
            state: Arc::new(Mutex::new(WatchdogState::default())),
        }
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Start monitoring a new evaluation. `on_abandon` runs with the number
    /// of checks made if the policy gives up.
    pub fn arm<F>(&self, on_abandon: F)
    where
        F: FnOnce(u32) + Send + 'static,
    {
        let mut state = self.lock();
        state.stop_timer();
        state.checks = 0;
        state.waiting_on_input = false;
        state.on_abandon = Some(Box::new(on_abandon));
        self.schedule(&mut state);
    }

    /// Stop monitoring; the abandon hook is dropped without running.
    pub fn disarm(&self) {
        let mut state = self.lock();
        state.stop_timer();
        state.waiting_on_input = false;
        state.on_abandon = None;
    }

    /// Pause enforcement while the evaluation waits on input.
    pub fn suspend_for_input(&self) {
        let mut state = self.lock();
        if state.on_abandon.is_none() {
            return;
        }
        state.stop_timer();
        state.waiting_on_input = true;
    }

    /// Re-arm with a full interval after input arrived.
    pub fn resume_after_input(&self) {
        let mut state = self.lock();
        if !state.waiting_on_input || state.on_abandon.is_none() {
            return;
        }
        state.waiting_on_input = false;
        self.schedule(&mut state);
    }

    pub fn is_armed(&self) -> bool {
        self.lock().deadline.is_some()
    }

    pub fn is_waiting_on_input(&self) -> bool {
        self.lock().waiting_on_input
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    pub fn checks(&self) -> u32 {
        self.lock().checks
    }

    fn schedule(&self, state: &mut WatchdogState) {
        state.generation += 1;
        let generation = state.generation;
        let deadline = Instant::now() + self.policy.time;
        state.deadline = Some(deadline);

        let watchdog = self.clone();
        state.timer = Some(tokio::spawn(async move {
            watchdog.monitor(generation, deadline).await;
        }));
    }

    async fn monitor(self, generation: u64, mut deadline: Instant) {
        loop {
            tokio::time::sleep_until(deadline).await;

            let checks = {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                state.checks += 1;
                state.checks
            };

            log::warn!("Evaluation exceeded its deadline (check #{})", checks);
            self.bus.publish(TIMEOUT, &json!({ "checks": checks }));

            if self.policy.gives_up(checks) {
                let hook = {
                    let mut state = self.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.deadline = None;
                    state.timer = None;
                    state.on_abandon.take()
                };
                log::warn!("Abandoning evaluation after {} checks", checks);
                if let Some(hook) = hook {
                    hook(checks);
                }
                return;
            }

            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            deadline += self.policy.time;
            state.deadline = Some(deadline);
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchdogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scripted(answers: &[bool]) -> TimeoutPredicate {
        let answers = Mutex::new(answers.iter().copied().collect::<VecDeque<_>>());
        Arc::new(move || answers.lock().unwrap().pop_front().unwrap_or(true))
    }

    fn record_timeouts(bus: &EventBus, start: Instant) -> Arc<Mutex<Vec<u128>>> {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        bus.subscribe(&[TIMEOUT], move |_, _| {
            fired_clone.lock().unwrap().push(start.elapsed().as_millis());
        });
        fired
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_until_predicate_gives_up() {
        let bus = EventBus::new();
        let start = Instant::now();
        let fired = record_timeouts(&bus, start);
        let policy = TimeoutPolicy {
            time: Duration::from_millis(100),
            callback: scripted(&[false, false, true]),
            max_checks: None,
        };
        let watchdog = Watchdog::new(bus, policy);

        let abandoned = Arc::new(Mutex::new(None));
        let abandoned_clone = abandoned.clone();
        watchdog.arm(move |checks| *abandoned_clone.lock().unwrap() = Some(checks));

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(*fired.lock().unwrap(), vec![100, 200, 300]);
        assert_eq!(*abandoned.lock().unwrap(), Some(3));
        assert!(!watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_before_deadline_never_fires() {
        let bus = EventBus::new();
        let fired = record_timeouts(&bus, Instant::now());
        let watchdog = Watchdog::new(bus, TimeoutPolicy::max_checks(Duration::from_millis(100), 1));

        watchdog.arm(|_| panic!("must not abandon"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        watchdog.disarm();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_wait_does_not_count_toward_deadline() {
        let bus = EventBus::new();
        let start = Instant::now();
        let fired = record_timeouts(&bus, start);
        let watchdog = Watchdog::new(bus, TimeoutPolicy::max_checks(Duration::from_millis(100), 1));
        watchdog.arm(|_| {});

        tokio::time::sleep(Duration::from_millis(80)).await;
        watchdog.suspend_for_input();
        assert!(watchdog.is_waiting_on_input());
        assert!(!watchdog.is_armed());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(fired.lock().unwrap().is_empty());

        watchdog.resume_after_input();
        assert_eq!(watchdog.deadline(), Some(start + Duration::from_millis(1180)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*fired.lock().unwrap(), vec![1180]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_resets_checks() {
        let bus = EventBus::new();
        let watchdog = Watchdog::new(
            bus,
            TimeoutPolicy {
                time: Duration::from_millis(10),
                callback: scripted(&[false, false, false, false]),
                max_checks: None,
            },
        );
        watchdog.arm(|_| {});
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(watchdog.checks(), 2);

        watchdog.arm(|_| {});
        assert_eq!(watchdog.checks(), 0);
        watchdog.disarm();
    }
}
