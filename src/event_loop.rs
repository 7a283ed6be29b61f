//! # Event Loop
//!
//! Single-consumer work loop for the daemon's main context.
//!
//! Connection reader tasks, socket pumps, and timers all cross into the
//! main context by posting work here. The loop owns three facilities:
//!
//! - `post(task)`: run a callable on the next iteration, in FIFO order
//! - `post_delayed(task, deadline)`: run a callable once a deadline passes
//! - `watch`/`signal`: per-endpoint readiness handlers dispatched with an
//!   [`IoEvents`] mask (READ, WRITE, ERROR, TIMEOUT)
//!
//! The loop runs in one dedicated task; handlers and posted work never run
//! concurrently with each other.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Readiness event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvents(u8);

impl IoEvents {
    pub const NONE: IoEvents = IoEvents(0);
    pub const READ: IoEvents = IoEvents(1 << 0);
    pub const WRITE: IoEvents = IoEvents(1 << 1);
    pub const ERROR: IoEvents = IoEvents(1 << 2);
    pub const TIMEOUT: IoEvents = IoEvents(1 << 3);

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: IoEvents) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// True when any bit is shared with `other`.
    pub fn intersects(self, other: IoEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for IoEvents {
    type Output = IoEvents;

    fn bitor(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 | rhs.0)
    }
}

/// Identifies a registered watcher; returned by [`EventLoopHandle::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

type LoopTask = Box<dyn FnOnce() + Send + 'static>;
type WatchHandler = Box<dyn FnMut(IoEvents) + Send + 'static>;

enum LoopMsg {
    Post(LoopTask),
    PostDelayed(Instant, LoopTask),
    Watch(WatchToken, IoEvents, WatchHandler),
    Signal(WatchToken, IoEvents),
    Unwatch(WatchToken),
    Shutdown,
}

/// Cloneable handle for scheduling work onto the loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    tx: mpsc::UnboundedSender<LoopMsg>,
    next_token: Arc<AtomicU64>,
}

impl EventLoopHandle {
    /// Schedule a callable to run inside the loop on the next iteration.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(LoopMsg::Post(Box::new(task)));
    }

    /// Schedule a callable to run once `deadline` has passed.
    pub fn post_delayed(&self, task: impl FnOnce() + Send + 'static, deadline: Instant) {
        let _ = self
            .tx
            .send(LoopMsg::PostDelayed(deadline, Box::new(task)));
    }

    /// Register a readiness handler. The handler fires inside the loop for
    /// every signal that intersects `interest`.
    pub fn watch(&self, interest: IoEvents, handler: WatchHandler) -> WatchToken {
        let token = WatchToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(LoopMsg::Watch(token, interest, handler));
        token
    }

    /// Report readiness for a watched endpoint.
    pub fn signal(&self, token: WatchToken, events: IoEvents) {
        let _ = self.tx.send(LoopMsg::Signal(token, events));
    }

    /// Drop a watcher. Signals already queued for it are discarded.
    pub fn unwatch(&self, token: WatchToken) {
        let _ = self.tx.send(LoopMsg::Unwatch(token));
    }

    /// Stop the loop after the work already queued ahead of this message.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopMsg::Shutdown);
    }
}

struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: LoopTask,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Watcher {
    interest: IoEvents,
    handler: WatchHandler,
}

/// The loop itself; drive it with [`EventLoop::run`] from a dedicated task.
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<LoopMsg>,
    timers: BinaryHeap<DelayedTask>,
    watchers: HashMap<WatchToken, Watcher>,
    seq: u64,
}

impl EventLoop {
    /// Create a loop and its handle.
    pub fn new() -> (Self, EventLoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let event_loop = Self {
            rx,
            timers: BinaryHeap::new(),
            watchers: HashMap::new(),
            seq: 0,
        };
        let handle = EventLoopHandle {
            tx,
            next_token: Arc::new(AtomicU64::new(1)),
        };
        (event_loop, handle)
    }

    /// Create a loop, spawn it on the current runtime, and return its handle.
    pub fn spawn() -> EventLoopHandle {
        let (event_loop, handle) = Self::new();
        tokio::spawn(event_loop.run());
        handle
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Event loop running");
        loop {
            let deadline = self.timers.peek().map(|t| t.deadline);
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    None | Some(LoopMsg::Shutdown) => break,
                    Some(msg) => self.dispatch(msg),
                },
                () = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => self.fire_due(),
            }
        }
        debug!(
            pending_timers = self.timers.len(),
            watchers = self.watchers.len(),
            "Event loop stopped"
        );
    }

    fn dispatch(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Post(task) => task(),
            LoopMsg::PostDelayed(deadline, task) => {
                self.seq += 1;
                self.timers.push(DelayedTask {
                    deadline,
                    seq: self.seq,
                    task,
                });
            }
            LoopMsg::Watch(token, interest, handler) => {
                self.watchers.insert(token, Watcher { interest, handler });
            }
            LoopMsg::Signal(token, events) => {
                if let Some(watcher) = self.watchers.get_mut(&token) {
                    if watcher.interest.intersects(events) {
                        trace!(?token, ?events, "Dispatching readiness");
                        (watcher.handler)(events);
                    }
                }
            }
            LoopMsg::Unwatch(token) => {
                self.watchers.remove(&token);
            }
            LoopMsg::Shutdown => {}
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while self
            .timers
            .peek()
            .is_some_and(|t| t.deadline <= now)
        {
            if let Some(due) = self.timers.pop() {
                (due.task)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let make = move |value: u32| {
            let seen = Arc::clone(&seen2);
            Box::new(move || seen.lock().unwrap().push(value)) as Box<dyn FnOnce() + Send>
        };
        (seen, make)
    }

    #[tokio::test]
    async fn post_runs_in_fifo_order() {
        let handle = EventLoop::spawn();
        let (seen, make) = collector();

        for i in 0..5 {
            handle.post(make(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn post_delayed_respects_deadlines() {
        let handle = EventLoop::spawn();
        let (seen, make) = collector();

        let now = Instant::now();
        handle.post_delayed(make(2), now + Duration::from_millis(60));
        handle.post_delayed(make(1), now + Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn watch_filters_by_interest() {
        let handle = EventLoop::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);

        let token = handle.watch(
            IoEvents::ERROR,
            Box::new(move |events| seen2.lock().unwrap().push(events)),
        );

        handle.signal(token, IoEvents::READ);
        handle.signal(token, IoEvents::ERROR);
        handle.signal(token, IoEvents::READ | IoEvents::ERROR);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fired = seen.lock().unwrap().clone();
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().all(|e| e.contains(IoEvents::ERROR)));
    }

    #[tokio::test]
    async fn unwatch_drops_handler() {
        let handle = EventLoop::spawn();
        let seen = Arc::new(Mutex::new(0u32));
        let seen2 = Arc::clone(&seen);

        let token = handle.watch(
            IoEvents::READ,
            Box::new(move |_| *seen2.lock().unwrap() += 1),
        );
        handle.signal(token, IoEvents::READ);
        handle.unwatch(token);
        handle.signal(token, IoEvents::READ);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (event_loop, handle) = EventLoop::new();
        let join = tokio::spawn(event_loop.run());
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[test]
    fn event_mask_operations() {
        let mask = IoEvents::READ | IoEvents::ERROR;
        assert!(mask.contains(IoEvents::READ));
        assert!(mask.contains(IoEvents::ERROR));
        assert!(!mask.contains(IoEvents::WRITE));
        assert!(mask.intersects(IoEvents::ERROR | IoEvents::TIMEOUT));
        assert!(!mask.intersects(IoEvents::WRITE));
        assert!(IoEvents::NONE.is_empty());
        assert!(!mask.contains(IoEvents::NONE));
    }
}
