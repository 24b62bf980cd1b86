//! Shared timeout timer
//!
//! One background thread services every armed promise timeout. Entries
//! hold a weak promise reference plus the arm generation recorded when
//! they were scheduled; re-arming or closing a promise bumps its
//! generation, so stale entries fire as no-ops. There is no removal,
//! cancellation is purely generational.

use crate::promise::Promise;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Instant;

struct Entry {
    deadline: Instant,
    generation: u64,
    promise: Weak<Promise>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

struct Timer {
    heap: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
}

impl Timer {
    fn run(&self) {
        let mut heap = self.heap.lock().unwrap();
        loop {
            let now = Instant::now();
            while heap.peek().map_or(false, |e| e.deadline <= now) {
                let entry = match heap.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                // Fire outside the heap lock; reject takes promise locks.
                drop(heap);
                if let Some(promise) = entry.promise.upgrade() {
                    promise.timeout_fired(entry.generation);
                }
                heap = self.heap.lock().unwrap();
            }

            match heap.peek().map(|e| e.deadline) {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    let (guard, _) = self.cv.wait_timeout(heap, wait).unwrap();
                    heap = guard;
                }
                None => {
                    heap = self.cv.wait(heap).unwrap();
                }
            }
        }
    }
}

static TIMER: OnceLock<Arc<Timer>> = OnceLock::new();

fn timer() -> &'static Arc<Timer> {
    TIMER.get_or_init(|| {
        let timer = Arc::new(Timer {
            heap: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
        });
        let worker = Arc::clone(&timer);
        thread::Builder::new()
            .name("pledge-timer".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn timer thread");
        timer
    })
}

/// Arms a timeout for the given promise and arm generation.
pub(crate) fn schedule(deadline: Instant, generation: u64, promise: Weak<Promise>) {
    let timer = timer();
    timer.heap.lock().unwrap().push(Entry {
        deadline,
        generation,
        promise,
    });
    timer.cv.notify_one();
}
