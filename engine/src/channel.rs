//! Single-slot byte handoff between one producer and one consumer thread.
//!
//! The producer fills its own buffer and swaps it into the slot; the consumer
//! swaps the slot's buffer out into its own. Buffers change hands, they are
//! never touched by both sides at once. `full` is the only ownership signal.
//!
//! Either side may stop early. The producer marks the stream finished and the
//! consumer closes the channel; the guards below do this on drop so an error
//! or panic on one side never leaves the other blocked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Cooperative cancellation flag shared between the caller and the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; checked at every buffer handoff and commit.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    slot: Vec<u8>,
    full: bool,
    producer_done: bool,
    consumer_closed: bool,
}

/// One-payload handoff. Exactly one producer and one consumer per instance.
#[derive(Debug)]
pub struct ByteChannel {
    state: Mutex<ChannelState>,
    signal: Condvar,
    capacity: usize,
}

impl ByteChannel {
    /// Create a channel whose payloads are at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        ByteChannel {
            state: Mutex::new(ChannelState::default()),
            signal: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Maximum payload size the producer should read per handoff.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `buffer` to the consumer.
    ///
    /// Blocks until the previous payload has been taken. On return `buffer`
    /// holds an empty recycled buffer. Returns false if the consumer closed
    /// the channel; the payload is dropped in that case.
    pub fn put(&self, buffer: &mut Vec<u8>) -> bool {
        let mut state = self.lock();
        while state.full && !state.consumer_closed {
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.consumer_closed {
            return false;
        }

        std::mem::swap(&mut state.slot, buffer);
        state.full = true;
        drop(state);
        self.signal.notify_all();

        buffer.clear();
        true
    }

    /// Receive the next payload into `buffer`.
    ///
    /// Blocks until a payload is published or the producer finishes.
    /// Returns the payload length, or None at end of stream. Zero-length
    /// payloads are delivered as `Some(0)`.
    pub fn take(&self, buffer: &mut Vec<u8>) -> Option<usize> {
        let mut state = self.lock();
        while !state.full && !state.producer_done {
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if !state.full {
            return None;
        }

        std::mem::swap(&mut state.slot, buffer);
        state.full = false;
        drop(state);
        self.signal.notify_all();

        Some(buffer.len())
    }

    /// Producer side: no further payloads will be published.
    pub fn finish(&self) {
        self.lock().producer_done = true;
        self.signal.notify_all();
    }

    /// Consumer side: stop accepting payloads and release a blocked producer.
    pub fn close(&self) {
        self.lock().consumer_closed = true;
        self.signal.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().producer_done
    }

    /// Guard that calls [`finish`](Self::finish) when dropped.
    pub fn producer_guard(&self) -> ProducerGuard<'_> {
        ProducerGuard(self)
    }

    /// Guard that calls [`close`](Self::close) when dropped.
    pub fn consumer_guard(&self) -> ConsumerGuard<'_> {
        ConsumerGuard(self)
    }
}

/// Marks the stream finished on every producer exit path.
pub struct ProducerGuard<'a>(&'a ByteChannel);

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Closes the channel on every consumer exit path.
pub struct ConsumerGuard<'a>(&'a ByteChannel);

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn run_handoffs(payloads: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let channel = Arc::new(ByteChannel::new(64));
        let producer_channel = Arc::clone(&channel);
        let sent = payloads.clone();

        let producer = thread::spawn(move || {
            let _guard = producer_channel.producer_guard();
            for payload in sent {
                let mut buffer = payload;
                assert!(producer_channel.put(&mut buffer));
            }
        });

        let mut received = Vec::new();
        let mut buffer = Vec::new();
        while let Some(len) = channel.take(&mut buffer) {
            assert_eq!(len, buffer.len());
            received.push(buffer.clone());
        }
        producer.join().expect("Producer panicked");
        received
    }

    #[test]
    fn test_payloads_arrive_in_order() {
        let payloads = vec![vec![1, 2, 3], vec![4], vec![5, 6]];
        assert_eq!(run_handoffs(payloads.clone()), payloads);
    }

    #[test]
    fn test_zero_length_payload_is_delivered() {
        let payloads = vec![vec![], vec![9], vec![]];
        assert_eq!(run_handoffs(payloads.clone()), payloads);
    }

    #[test]
    fn test_finish_without_payload_ends_stream() {
        let channel = ByteChannel::new(16);
        channel.finish();
        let mut buffer = Vec::new();
        assert_eq!(channel.take(&mut buffer), None);
        assert!(channel.is_finished());
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let channel = Arc::new(ByteChannel::new(16));
        let mut first = vec![1u8; 4];
        assert!(channel.put(&mut first));

        let producer_channel = Arc::clone(&channel);
        let producer = thread::spawn(move || {
            // Slot is still full; this blocks until the consumer closes.
            let mut second = vec![2u8; 4];
            producer_channel.put(&mut second)
        });

        {
            let _guard = channel.consumer_guard();
        }
        let accepted = producer.join().expect("Producer panicked");
        assert!(!accepted);
    }

    #[test]
    fn test_guard_finishes_on_early_return() {
        let channel = Arc::new(ByteChannel::new(16));
        let producer_channel = Arc::clone(&channel);

        let producer = thread::spawn(move || -> Result<(), String> {
            let _guard = producer_channel.producer_guard();
            let mut buffer = vec![7u8; 3];
            producer_channel.put(&mut buffer);
            Err("simulated read failure".to_string())
        });

        let mut buffer = Vec::new();
        assert_eq!(channel.take(&mut buffer), Some(3));
        assert_eq!(channel.take(&mut buffer), None);
        assert!(producer.join().expect("Producer panicked").is_err());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_handoffs_preserve_bytes_and_order(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..40)
        ) {
            let received = run_handoffs(payloads.clone());
            prop_assert_eq!(received, payloads);
        }
    }
}
