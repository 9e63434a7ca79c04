use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on callbacks run by a single `run_until_idle`, so a
/// self-rescheduling timer cannot spin forever.
const MAX_IDLE_RUNS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

type Task = Box<dyn FnOnce()>;

struct LoopState {
    epoch_ms: u64,
    now: Duration,
    next_id: u32,
    queue: BTreeMap<(Duration, TimerId), Task>,
    deadlines: HashMap<TimerId, Duration>,
}

/// Single-threaded timer queue driven by an explicit clock.
///
/// Nothing runs until the owner pumps the loop with `advance` or
/// `run_until_idle`; callbacks fire in deadline order and may schedule more
/// work. Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    state: Rc<RefCell<LoopState>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// A loop whose wall clock starts at the current system time.
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_epoch(epoch_ms)
    }

    pub fn with_epoch(epoch_ms: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(LoopState {
                epoch_ms,
                now: Duration::ZERO,
                next_id: 1,
                queue: BTreeMap::new(),
                deadlines: HashMap::new(),
            })),
        }
    }

    /// Time elapsed on this loop's clock.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Milliseconds since the Unix epoch, as `Date.now()` would report.
    pub fn wall_clock_ms(&self) -> u64 {
        let state = self.state.borrow();
        state.epoch_ms + state.now.as_millis() as u64
    }

    pub fn set_timeout<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.state.borrow_mut();
        let id = TimerId(state.next_id);
        state.next_id = state.next_id.wrapping_add(1).max(1);
        let deadline = state.now + delay;
        state.queue.insert((deadline, id), Box::new(task));
        state.deadlines.insert(id, deadline);
        id
    }

    pub fn clear_timeout(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if let Some(deadline) = state.deadlines.remove(&id) {
            state.queue.remove(&(deadline, id));
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.state.borrow().queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Deadline of the earliest pending timer, relative to the loop's start.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.state
            .borrow()
            .queue
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Move the clock forward by `by`, running every timer that falls due on
    /// the way. Returns how many callbacks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut ran = 0;
        while let Some(task) = self.pop_due(target) {
            task();
            ran += 1;
        }
        self.state.borrow_mut().now = target;
        ran
    }

    /// Run timers until none remain, jumping the clock to each deadline.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while ran < MAX_IDLE_RUNS {
            let Some(deadline) = self.next_deadline() else {
                break;
            };
            let Some(task) = self.pop_due(deadline) else {
                break;
            };
            task();
            ran += 1;
        }
        if ran == MAX_IDLE_RUNS {
            tracing::warn!(target: "timers", "event loop still busy after {MAX_IDLE_RUNS} callbacks");
        }
        ran
    }

    fn pop_due(&self, limit: Duration) -> Option<Task> {
        let mut state = self.state.borrow_mut();
        let key = *state.queue.keys().next()?;
        if key.0 > limit {
            return None;
        }
        let task = state.queue.remove(&key)?;
        state.deadlines.remove(&key.1);
        if key.0 > state.now {
            state.now = key.0;
        }
        Some(task)
    }
}
