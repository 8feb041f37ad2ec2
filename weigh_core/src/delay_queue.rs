//! One scheduler thread holding delayed items in a min-heap of due times.
//!
//! Items are handed to the delivery closure once due. Stopping discards
//! whatever is still pending, so nothing scheduled outlives `stop()`.
use crate::worker::{StopSignal, Worker};
use crossbeam_channel as xch;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on a single idle wait when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed so the max-heap pops the earliest due time; ties keep insertion order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct DelayQueue<T> {
    tx: Option<xch::Sender<(Instant, T)>>,
    pending: Arc<AtomicUsize>,
    worker: Option<Worker>,
}

impl<T: Send + 'static> DelayQueue<T> {
    pub fn start<F>(name: &str, stop_timeout: Duration, mut deliver: F) -> std::io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = xch::unbounded::<(Instant, T)>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();
        let worker = Worker::spawn(name, stop_timeout, move |stop| {
            run(&rx, &stop, &counter, &mut deliver);
        })?;
        Ok(Self {
            tx: Some(tx),
            pending,
            worker: Some(worker),
        })
    }

    /// Returns false once the queue has been stopped.
    pub fn schedule(&self, item: T, delay: Duration) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        if tx.send((Instant::now() + delay, item)).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Items scheduled and not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
    }
}

impl<T> Drop for DelayQueue<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(mut w) = self.worker.take() {
            w.stop();
        }
    }
}

fn run<T>(
    rx: &xch::Receiver<(Instant, T)>,
    stop: &StopSignal,
    pending: &AtomicUsize,
    deliver: &mut impl FnMut(T),
) {
    let mut heap: BinaryHeap<Entry<T>> = BinaryHeap::new();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.due <= now) {
            if let Some(e) = heap.pop() {
                pending.fetch_sub(1, Ordering::Relaxed);
                deliver(e.item);
            }
        }
        let wait = heap
            .peek()
            .map_or(IDLE_WAIT, |e| e.due.saturating_duration_since(Instant::now()));
        xch::select! {
            recv(rx) -> msg => match msg {
                Ok((due, item)) => {
                    seq += 1;
                    heap.push(Entry { due, seq, item });
                }
                Err(_) => break,
            },
            recv(stop.receiver()) -> _ => break,
            default(wait) => {}
        }
    }
    if !heap.is_empty() {
        tracing::debug!(discarded = heap.len(), "delay queue stopped with pending items");
    }
    pending.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn items_arrive_in_due_order() {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        let mut q = DelayQueue::start("test-delay", Duration::from_secs(1), move |v: u32| {
            sink.lock().expect("lock").push(v);
        })
        .expect("start");
        assert!(q.schedule(3, Duration::from_millis(90)));
        assert!(q.schedule(1, Duration::from_millis(10)));
        assert!(q.schedule(2, Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*got.lock().expect("lock"), vec![1, 2, 3]);
        assert_eq!(q.pending(), 0);
        q.stop();
        assert!(!q.schedule(4, Duration::ZERO));
    }

    #[test]
    fn stop_discards_pending_items_promptly() {
        let got = Arc::new(AtomicUsize::new(0));
        let sink = got.clone();
        let mut q = DelayQueue::start("test-delay-stop", Duration::from_secs(1), move |_: u32| {
            sink.fetch_add(1, Ordering::Relaxed);
        })
        .expect("start");
        q.schedule(1, Duration::from_secs(30));
        let t0 = Instant::now();
        q.stop();
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(got.load(Ordering::Relaxed), 0);
    }
}
