//! A fixed pool of reusable job tokens with a committed FIFO
//!
//! A `TokenQueue` owns a fixed number of token slots created at construction. A caller acquires
//! a free token, fills it with a job description, and commits it; a single background worker
//! consumes committed tokens in FIFO order and eventually releases them back into the pool.
//! Because tokens are recycled instead of freed, steady state operation performs no per-job
//! allocation for the token itself.
//!
//! Acquiring beyond the pool capacity suspends the caller until a release frees a slot. Closing
//! the queue fails every pending and future acquire with [`Error::Closed`]; tokens already
//! committed remain readable by the worker (via [`CommittedStream::try_next`]) so it can drain
//! and fail them without deadlocking.

use crate::errors::Error;
use std::sync::Mutex;
use tokio::sync::{mpsc, Semaphore};

/// A fixed capacity pool of reusable tokens
///
/// Created with [`TokenQueue::new`], which also returns the single [`CommittedStream`] consumed
/// by the worker.
pub struct TokenQueue<T> {
    free: Mutex<Vec<T>>,
    permits: Semaphore,
    committed: mpsc::UnboundedSender<T>,
}

impl<T> TokenQueue<T> {
    /// Create a new `TokenQueue` holding the given tokens
    ///
    /// The capacity of the queue is fixed to `tokens.len()` for its whole lifetime.
    ///
    /// ```
    /// # let doc_test = async {
    /// use bowline::token::TokenQueue;
    ///
    /// let (queue, mut committed) = TokenQueue::new(vec![String::new(); 2]);
    ///
    /// let mut token = queue.acquire().await.unwrap();
    ///
    /// token.push_str("job");
    ///
    /// queue.commit(token).unwrap();
    ///
    /// assert_eq!(Some("job".to_string()), committed.next().await);
    /// # };
    /// # tokio_test::block_on(doc_test);
    /// ```
    pub fn new(tokens: Vec<T>) -> (Self, CommittedStream<T>) {
        let (committed, receiver) = mpsc::unbounded_channel();

        let queue = TokenQueue {
            permits: Semaphore::new(tokens.len()),
            free: Mutex::new(tokens),
            committed,
        };

        (queue, CommittedStream { receiver })
    }

    /// Acquire a free token
    ///
    /// This suspends while every token is acquired or committed. The returned token carries
    /// whatever state it was released with; the caller is expected to overwrite it.
    ///
    /// # Cancellation
    /// Dropping the returned future before completion does not consume a slot.
    pub async fn acquire(&self) -> Result<T, Error> {
        let permit = self.permits.acquire().await.map_err(|_| Error::Closed)?;

        permit.forget();

        let token = self
            .free
            .lock()
            .expect("token pool lock poisoned")
            .pop()
            .expect("token pool empty with a permit held");

        Ok(token)
    }

    /// Commit a token to the worker's FIFO
    ///
    /// The token must have been acquired from this queue, otherwise the pool capacity accounting
    /// is corrupted.
    pub fn commit(&self, token: T) -> Result<(), Error> {
        self.committed.send(token).map_err(|_| Error::Closed)
    }

    /// Release a token back into the free pool
    ///
    /// One blocked `acquire` call is woken.
    pub fn release(&self, token: T) {
        self.free.lock().expect("token pool lock poisoned").push(token);

        self.permits.add_permits(1);
    }

    /// Close the queue
    ///
    /// Every blocked and future call to `acquire` fails with [`Error::Closed`]. Closing is
    /// idempotent. Already committed tokens stay available to the worker for draining.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Check whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// The consuming end of a [`TokenQueue`]'s committed FIFO
///
/// There is exactly one `CommittedStream` per queue; it is held by the worker task.
pub struct CommittedStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> CommittedStream<T> {
    /// Get the next committed token, suspending until one is committed
    ///
    /// Returns `None` once the owning `TokenQueue` is dropped and the FIFO is empty.
    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take the next committed token without suspending
    ///
    /// Used by the worker to drain the FIFO during shutdown.
    pub fn try_next(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn committed_tokens_are_fifo() {
        let (queue, mut stream) = TokenQueue::new(vec![Vec::new(); 3]);

        for job in 1u8..=3 {
            let mut token = queue.acquire().await.unwrap();

            token.clear();
            token.push(job);

            queue.commit(token).unwrap();
        }

        assert_eq!(Some(vec![1]), stream.next().await);
        assert_eq!(Some(vec![2]), stream.next().await);
        assert_eq!(Some(vec![3]), stream.next().await);
    }

    #[tokio::test]
    async fn acquire_blocks_at_capacity() {
        let (queue, mut stream) = TokenQueue::new(vec![(); 1]);

        let queue = Arc::new(queue);

        let held = queue.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let queue = queue.clone();

            async move { queue.acquire().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!waiter.is_finished());

        queue.release(held);

        assert!(waiter.await.unwrap().is_ok());

        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn close_fails_blocked_acquires() {
        let (queue, _stream) = TokenQueue::new(vec![(); 1]);

        let queue = Arc::new(queue);

        let _held = queue.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let queue = queue.clone();

            async move { queue.acquire().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();

        assert_eq!(Err(Error::Closed), waiter.await.unwrap());

        assert_eq!(Err(Error::Closed), queue.acquire().await);
    }

    #[tokio::test]
    async fn committed_tokens_drain_after_close() {
        let (queue, mut stream) = TokenQueue::new(vec![0u8; 2]);

        let token = queue.acquire().await.unwrap();

        queue.commit(token).unwrap();

        queue.close();

        assert!(stream.try_next().is_some());
        assert!(stream.try_next().is_none());
    }
}
