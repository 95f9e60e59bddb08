//! Per-resource periodic deploy and repair timers
//!
//! One dedicated thread sleeps until the earliest deadline. Each resource has
//! at most one live timer; replacing or stopping a timer bumps its generation
//! so the old heap entry is ignored when it comes due.

use crate::id::ResourceId;
use crate::types::TaskPriority;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Invoked on the timer thread when a timer fires
pub type TimerCallback = Arc<dyn Fn(ResourceId, TaskPriority) + Send + Sync>;

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64, ResourceId)>>,
    active: HashMap<ResourceId, (u64, TaskPriority)>,
    next_generation: u64,
    stopped: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct TimerManager {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer thread
    pub fn start(&self, callback: TimerCallback) -> std::io::Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Ok(());
        }
        self.inner.lock().stopped = false;
        let inner = Arc::clone(&self.inner);
        *thread = Some(
            thread::Builder::new()
                .name("deploy-timers".into())
                .spawn(move || run(&inner, &callback))?,
        );
        Ok(())
    }

    /// Fire `priority` for `resource` after `delay`, replacing its current timer
    pub fn set(&self, resource: &ResourceId, delay: Duration, priority: TaskPriority) {
        let mut state = self.inner.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state
            .active
            .insert(resource.clone(), (generation, priority));
        state
            .heap
            .push(Reverse((Instant::now() + delay, generation, resource.clone())));
        drop(state);
        self.inner.changed.notify_all();
    }

    /// Cancel the timer of a resource, if any
    pub fn stop_timer(&self, resource: &ResourceId) {
        self.inner.lock().active.remove(resource);
    }

    /// Priority of the live timer of a resource
    pub fn pending(&self, resource: &ResourceId) -> Option<TaskPriority> {
        self.inner.lock().active.get(resource).map(|(_, p)| *p)
    }

    /// Stop the thread and drop all timers
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock();
            state.stopped = true;
            state.heap.clear();
            state.active.clear();
        }
        self.inner.changed.notify_all();
    }

    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Timer thread panicked");
            }
        }
    }
}

fn run(inner: &Inner, callback: &TimerCallback) {
    loop {
        let mut fired = Vec::new();
        {
            let mut state = inner.lock();
            loop {
                if state.stopped {
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    None => {
                        state = inner
                            .changed
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(Reverse((deadline, _, _))) if *deadline > now => {
                        let wait = *deadline - now;
                        state = inner
                            .changed
                            .wait_timeout(state, wait)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    Some(_) => break,
                }
            }

            let now = Instant::now();
            while let Some(Reverse((deadline, generation, resource))) = state.heap.pop() {
                if deadline > now {
                    state.heap.push(Reverse((deadline, generation, resource)));
                    break;
                }
                if let Some(&(live, priority)) = state.active.get(&resource) {
                    if live == generation {
                        state.active.remove(&resource);
                        fired.push((resource, priority));
                    }
                }
            }
        }

        for (resource, priority) in fired {
            log::debug!("Timer fired for {resource} ({priority:?})");
            callback(resource, priority);
        }
    }
}
