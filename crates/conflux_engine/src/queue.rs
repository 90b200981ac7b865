//! Per-actor message queues and timed method calls.
//!
//! Every actor owns exactly one [`EventLoop`]; all cross-actor effects are
//! messages sent into it through cloned [`QueueSender`]s. Delivery within
//! one queue is FIFO; there is no ordering guarantee across queues.
//!
//! Method calls are tracked on the *caller's* loop: [`EventLoop::arm`]
//! registers a deadline whose expiry synthesizes a timeout reply as if the
//! remote had answered. Delivering the synthesized reply resolves the call;
//! a real reply resolves it through [`EventLoop::disarm`], whose return
//! value tells the caller whether it won the race against the timeout.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-unique identifier for one method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

impl CallId {
    /// Allocates a fresh call id.
    pub fn next() -> Self {
        CallId(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sending half of an actor's queue. Cheap to clone.
#[derive(Debug)]
pub struct QueueSender<M> {
    tx: Sender<M>,
}

impl<M> Clone for QueueSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> QueueSender<M> {
    /// Enqueues a message; returns false if the consuming loop is gone.
    pub fn send(&self, msg: M) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// What [`EventLoop::next`] produced.
#[derive(Debug)]
pub enum Polled<M> {
    /// A message arrived (real or synthesized from a timeout).
    Message(M),
    /// Every sender is gone and the queue is drained.
    Closed,
}

/// The consuming side of an actor's queue, with the pending-call table.
#[derive(Debug)]
pub struct EventLoop<M> {
    tx: Sender<M>,
    rx: Receiver<M>,
    pending: HashMap<CallId, M>,
    deadlines: BinaryHeap<Reverse<(Instant, CallId)>>,
}

impl<M> EventLoop<M> {
    /// Creates a new event loop with its queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Returns a sender for this loop's queue.
    pub fn sender(&self) -> QueueSender<M> {
        QueueSender {
            tx: self.tx.clone(),
        }
    }

    /// Registers an outstanding method call. If no reply disarms `id`
    /// within `timeout`, `on_timeout` is delivered as if it were the reply.
    pub fn arm(&mut self, id: CallId, timeout: Duration, on_timeout: M) {
        let deadline = Instant::now() + timeout;
        self.pending.insert(id, on_timeout);
        self.deadlines.push(Reverse((deadline, id)));
    }

    /// Resolves an outstanding call on behalf of a real reply. Returns
    /// true if the call was still pending; false means the timeout was
    /// already synthesized (or the call resolved earlier) and the reply
    /// lost the race.
    pub fn disarm(&mut self, id: CallId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Number of calls still awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Blocks until the next message or timeout synthesis.
    pub fn next(&mut self) -> Polled<M> {
        loop {
            // Expired deadlines synthesize their timeout reply; stale
            // entries for already-answered calls are skipped.
            let now = Instant::now();
            if let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
                if deadline <= now {
                    self.deadlines.pop();
                    if let Some(msg) = self.pending.remove(&id) {
                        return Polled::Message(msg);
                    }
                    continue;
                }
                match self.rx.recv_deadline(deadline) {
                    Ok(msg) => return Polled::Message(msg),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Polled::Closed,
                }
            }
            match self.rx.recv() {
                Ok(msg) => return Polled::Message(msg),
                Err(_) => return Polled::Closed,
            }
        }
    }

    /// Non-blocking variant of [`EventLoop::next`]; returns `None` when
    /// nothing is ready.
    pub fn try_next(&mut self) -> Option<M> {
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(msg) = self.pending.remove(&id) {
                return Some(msg);
            }
        }
        self.rx.try_recv().ok()
    }
}

impl<M> Default for EventLoop<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq, Eq)]
    enum Msg {
        Ping(u32),
        Reply(CallId, bool),
        TimedOut(CallId),
    }

    #[test]
    fn fifo_delivery() {
        let mut lp: EventLoop<Msg> = EventLoop::new();
        let tx = lp.sender();
        for i in 0..5 {
            assert!(tx.send(Msg::Ping(i)));
        }
        for i in 0..5 {
            match lp.next() {
                Polled::Message(Msg::Ping(n)) => assert_eq!(n, i),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn timeout_synthesizes_exactly_one_reply() {
        let mut lp: EventLoop<Msg> = EventLoop::new();
        let id = CallId::next();
        lp.arm(id, Duration::from_millis(10), Msg::TimedOut(id));

        let start = Instant::now();
        match lp.next() {
            Polled::Message(Msg::TimedOut(got)) => assert_eq!(got, id),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(lp.pending_calls(), 0);
        assert!(lp.try_next().is_none());
    }

    #[test]
    fn real_reply_beats_timeout() {
        let mut lp: EventLoop<Msg> = EventLoop::new();
        let tx = lp.sender();
        let id = CallId::next();
        lp.arm(id, Duration::from_millis(50), Msg::TimedOut(id));
        tx.send(Msg::Reply(id, true));

        match lp.next() {
            Polled::Message(Msg::Reply(got, _)) => {
                assert_eq!(got, id);
                assert!(lp.disarm(got), "first resolution wins");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // The stale deadline entry must not resurrect the call.
        thread::sleep(Duration::from_millis(60));
        assert!(lp.try_next().is_none());
    }

    #[test]
    fn late_reply_after_timeout_is_dropped() {
        let mut lp: EventLoop<Msg> = EventLoop::new();
        let tx = lp.sender();
        let id = CallId::next();
        lp.arm(id, Duration::from_millis(5), Msg::TimedOut(id));

        match lp.next() {
            Polled::Message(Msg::TimedOut(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }

        // The remote answers anyway; disarm reports the race was lost.
        tx.send(Msg::Reply(id, true));
        match lp.next() {
            Polled::Message(Msg::Reply(got, _)) => assert!(!lp.disarm(got)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cross_thread_send() {
        let mut lp: EventLoop<Msg> = EventLoop::new();
        let tx = lp.sender();
        let handle = thread::spawn(move || {
            tx.send(Msg::Ping(7));
        });
        match lp.next() {
            Polled::Message(Msg::Ping(7)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn closed_when_all_senders_dropped() {
        let lp: EventLoop<Msg> = EventLoop::new();
        // The loop keeps its own sender; dropping the loop is the only
        // way to close the queue, so senders just report success.
        let tx = lp.sender();
        drop(lp);
        assert!(!tx.send(Msg::Ping(0)));
    }
}
