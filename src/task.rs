use crate::errof;
use crate::errors::{NowError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Inter-thread FIFO. Bounded (`max > 0`) or unbounded; enqueue blocks
/// while full, dequeue blocks until a message arrives, the timeout expires
/// or the queue is closed and empty.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    notempty: Condvar,
    notfull: Condvar,
    max: usize,
}

struct Inner<T> {
    list: VecDeque<T>,
    closed: bool,
}

impl<T> Queue<T> {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { list: VecDeque::new(), closed: false }),
            notempty: Condvar::new(),
            notfull: Condvar::new(),
            max,
        }
    }

    /// Append a message; blocks while the queue is full.
    pub fn enqueue(&self, msg: T) -> Result<()> {
        let mut g = self.inner.lock();
        while !g.closed && self.max > 0 && g.list.len() >= self.max {
            self.notfull.wait(&mut g);
        }
        if g.closed {
            return Err(errof!(NoRsc, "queue", "enqueue on closed queue"));
        }
        g.list.push_back(msg);
        self.notempty.notify_one();
        Ok(())
    }

    /// Prepend a message; goes through even when the queue is full.
    pub fn enqueue_prio(&self, msg: T) -> Result<()> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(errof!(NoRsc, "queue", "enqueue on closed queue"));
        }
        g.list.push_front(msg);
        self.notempty.notify_one();
        Ok(())
    }

    /// Remove the head. `timeout` of `None` blocks indefinitely; a zero
    /// timeout on an empty open queue returns `Timeout` after zero waits.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Result<T> {
        let mut g = self.inner.lock();
        loop {
            if let Some(msg) = g.list.pop_front() {
                self.notfull.notify_one();
                return Ok(msg);
            }
            if g.closed {
                return Err(errof!(NoRsc, "queue", "queue closed"));
            }
            match timeout {
                None => {
                    self.notempty.wait(&mut g);
                }
                Some(t) => {
                    if t.is_zero() || self.notempty.wait_for(&mut g, t).timed_out() {
                        if let Some(msg) = g.list.pop_front() {
                            self.notfull.notify_one();
                            return Ok(msg);
                        }
                        if g.closed {
                            return Err(errof!(NoRsc, "queue", "queue closed"));
                        }
                        return Err(errof!(Timeout, "queue"));
                    }
                }
            }
        }
    }

    /// Reject new enqueues and wake all waiters. Pending messages remain
    /// dequeueable.
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        self.notempty.notify_all();
        self.notfull.notify_all();
    }

    /// Reopen after `close`. No effect when already open.
    pub fn open(&self) {
        self.inner.lock().closed = false;
    }

    /// Remove all pending messages, feeding each to `drain`.
    pub fn drain(&self, mut drain: impl FnMut(T)) {
        let mut g = self.inner.lock();
        while let Some(m) = g.list.pop_front() {
            drain(m);
        }
        self.notfull.notify_all();
    }

    /// Close and drain in one step.
    pub fn shutdown(&self, drain: impl FnMut(T)) {
        self.close();
        self.drain(drain);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().list.is_empty()
    }
}

/// A background worker: one or more OS threads draining a shared queue.
/// With a period, the job also runs on every timeout tick (with `None` as
/// message). Errors are pushed to the error queue when one is attached,
/// and the worker stays alive.
pub struct Worker<T: Send + 'static> {
    pub queue: Arc<Queue<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn spawn<F>(
        name: &'static str,
        nthreads: usize,
        period: Option<Duration>,
        errq: Option<Arc<Queue<NowError>>>,
        job: F,
    ) -> Self
    where
        F: Fn(Option<T>) -> Result<()> + Send + Sync + 'static,
    {
        let queue: Arc<Queue<T>> = Arc::new(Queue::new(0));
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(nthreads);
        for i in 0..nthreads {
            let q = Arc::clone(&queue);
            let j = Arc::clone(&job);
            let eq = errq.clone();
            let h = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    loop {
                        let msg = match q.dequeue(period) {
                            Ok(m) => Some(m),
                            Err(e) if e.is(crate::errors::ErrorKind::Timeout) => None,
                            Err(_) => break, // closed and empty
                        };
                        if let Err(e) = j(msg) {
                            match &eq {
                                Some(q) => {
                                    let _ = q.enqueue(e);
                                }
                                None => log::error!("worker {name}: {e}"),
                            }
                        }
                    }
                })
                .expect("spawn worker thread");
            handles.push(h);
        }
        Self { queue, handles }
    }

    /// Close the queue and join all threads.
    pub fn stop(&mut self) {
        self.queue.close();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = Queue::new(0);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.enqueue_prio(0).unwrap();
        assert_eq!(q.dequeue(None).unwrap(), 0);
        assert_eq!(q.dequeue(None).unwrap(), 1);
        assert_eq!(q.dequeue(None).unwrap(), 2);
    }

    #[test]
    fn zero_timeout_on_empty() {
        let q: Queue<u8> = Queue::new(0);
        let e = q.dequeue(Some(Duration::ZERO)).unwrap_err();
        assert!(e.is(crate::errors::ErrorKind::Timeout));
    }

    #[test]
    fn closed_queue_behaviour() {
        let q = Queue::new(0);
        q.enqueue(7).unwrap();
        q.close();
        assert!(q.enqueue(8).is_err());
        assert_eq!(q.dequeue(None).unwrap(), 7);
        assert!(q.dequeue(None).unwrap_err().is(crate::errors::ErrorKind::NoRsc));
    }

    #[test]
    fn shutdown_drains() {
        let q = Queue::new(0);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        let mut seen = Vec::new();
        q.shutdown(|m| seen.push(m));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn worker_processes_messages() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut w = Worker::spawn("test", 2, None, None, move |m: Option<u32>| {
            if m.is_some() {
                c.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        for i in 0..10 {
            w.queue.enqueue(i).unwrap();
        }
        w.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
