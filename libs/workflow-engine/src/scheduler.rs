//! Retry/timeout scheduler (§4.4): a path-keyed min-heap by firing time.
//!
//! `BinaryHeap` is a max-heap, so entries are keyed by `Reverse<(At, seq)>`
//! to get min-heap-by-time ordering (`seq` breaks ties deterministically).
//! `BinaryHeap` has no live-removal, so cancellation is modeled the standard
//! Rust way: each path's current generation is tracked in `slots`; a popped
//! entry whose generation no longer matches `slots` is a tombstone and is
//! silently dropped. A single `tokio::spawn`ed task owns the heap; external
//! mutations wake it via `tokio::sync::Notify`, and it sleeps on the next
//! deadline with `tokio::time::sleep_until` — the async analogue of the
//! teacher's goroutine-plus-channel scheduler pattern (see
//! `executor::auto_process`'s use of `backoff::future::retry` for the single-
//! task retry idiom this generalizes into a multi-task scheduler).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A hierarchical scheduler key, e.g. `["timeout", flow_id, step_id, attr]`
/// or `["retry", flow_id, step_id, token]`.
pub type Path = Vec<String>;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Entry {
    path: Path,
    at: DateTime<Utc>,
    seq: u64,
    generation: u64,
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
}

struct HeapKey {
    at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct HeapEntry {
    key: HeapKey,
    entry: Entry,
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    slots: HashMap<Path, u64>,
}

/// A path-keyed task scheduler. Cheap to clone; clones share the same heap
/// and background task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    seq: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                heap: BinaryHeap::new(),
                slots: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
            seq: Arc::new(AtomicU64::new(0)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background drain loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self.task.lock().expect("scheduler task lock poisoned");
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let notify = self.notify.clone();
        *guard = Some(tokio::spawn(Self::run(inner, notify)));
    }

    /// Stop the background drain loop without running remaining tasks.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("scheduler task lock poisoned").take() {
            handle.abort();
        }
    }

    async fn run(inner: Arc<Mutex<Inner>>, notify: Arc<Notify>) {
        loop {
            let next_at = {
                let guard = inner.lock().expect("scheduler inner lock poisoned");
                guard.heap.peek().map(|Reverse(e)| e.key.at)
            };

            match next_at {
                None => notify.notified().await,
                Some(at) => {
                    let now = Utc::now();
                    if at > now {
                        let sleep = tokio::time::sleep(
                            (at - now).to_std().unwrap_or(std::time::Duration::ZERO),
                        );
                        tokio::select! {
                            () = sleep => {}
                            () = notify.notified() => continue,
                        }
                    }

                    let due: Vec<Entry> = {
                        let mut guard = inner.lock().expect("scheduler inner lock poisoned");
                        let mut due = Vec::new();
                        let now = Utc::now();
                        while let Some(Reverse(top)) = guard.heap.peek() {
                            if top.key.at > now {
                                break;
                            }
                            let Reverse(HeapEntry { entry, .. }) = guard.heap.pop().unwrap();
                            if guard.slots.get(&entry.path) == Some(&entry.generation) {
                                guard.slots.remove(&entry.path);
                                due.push(entry);
                            }
                        }
                        due
                    };

                    for entry in due {
                        (entry.run)().await;
                    }
                }
            }
        }
    }

    /// `Schedule(path, at, fn)`: replaces any existing task at `path`.
    pub fn schedule<F, Fut>(&self, path: Path, at: DateTime<Utc>, run: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.inner.lock().expect("scheduler inner lock poisoned");
        let generation = guard.slots.entry(path.clone()).or_insert(0);
        *generation += 1;
        let generation = *generation;

        let entry = Entry {
            path,
            at,
            seq,
            generation,
            run: Box::new(move || Box::pin(run()) as BoxFuture),
        };
        guard.heap.push(Reverse(HeapEntry {
            key: HeapKey { at, seq },
            entry,
        }));
        drop(guard);
        self.notify.notify_one();
    }

    /// `Cancel(path)`: remove the exact path, if present.
    pub fn cancel(&self, path: &Path) {
        let mut guard = self.inner.lock().expect("scheduler inner lock poisoned");
        guard.slots.remove(path);
    }

    /// `CancelPrefix(prefix)`: remove every task whose path starts with
    /// `prefix`.
    pub fn cancel_prefix(&self, prefix: &[String]) {
        let mut guard = self.inner.lock().expect("scheduler inner lock poisoned");
        guard.slots.retain(|path, _| !path.starts_with(prefix));
    }

    /// Number of live (non-canceled) scheduled tasks. Exposed for tests.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().expect("scheduler inner lock poisoned").slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn rescheduling_the_same_path_runs_only_the_latest_fn() {
        let scheduler = Scheduler::new();
        scheduler.start();
        let fired = Arc::new(AtomicUsize::new(0));

        let path = vec!["retry".to_string(), "wf-1".to_string()];
        let at = Utc::now() + chrono::Duration::milliseconds(50);

        scheduler.schedule(path.clone(), at, || async {});

        let fired2 = fired.clone();
        scheduler.schedule(path, at, move || {
            let fired2 = fired2.clone();
            async move {
                fired2.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_firing_prevents_invocation() {
        let scheduler = Scheduler::new();
        scheduler.start();
        let fired = Arc::new(AtomicUsize::new(0));

        let path = vec!["timeout".to_string(), "wf-1".to_string()];
        let at = Utc::now() + chrono::Duration::milliseconds(50);

        let fired2 = fired.clone();
        scheduler.schedule(path.clone(), at, move || {
            let fired2 = fired2.clone();
            async move {
                fired2.fetch_add(1, Ordering::SeqCst);
            }
        });
        scheduler.cancel(&path);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_prefix_removes_matching_paths() {
        let scheduler = Scheduler::new();
        scheduler.schedule(
            vec!["retry".into(), "wf-1".into(), "a".into()],
            Utc::now() + chrono::Duration::seconds(10),
            || async {},
        );
        scheduler.schedule(
            vec!["retry".into(), "wf-1".into(), "b".into()],
            Utc::now() + chrono::Duration::seconds(10),
            || async {},
        );
        scheduler.schedule(
            vec!["retry".into(), "wf-2".into(), "a".into()],
            Utc::now() + chrono::Duration::seconds(10),
            || async {},
        );

        scheduler.cancel_prefix(&["retry".into(), "wf-1".into()]);
        assert_eq!(scheduler.live_count(), 1);
    }
}
