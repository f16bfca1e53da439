//! Bounded admission queue.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::AcqRel, Ordering::Acquire},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use snafu::Snafu;
use tokio::sync::{Semaphore, TryAcquireError};

/// An admission error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum AdmissionError {
    /// No slot freed up before the admission deadline.
    #[snafu(display("no admission slot became available within {:?}", timeout))]
    TimedOut {
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The queue has been closed to new admissions.
    #[snafu(display("admission queue is closed"))]
    Closed,
}

/// A fixed-capacity FIFO that bounds how many requests are in flight at once.
///
/// Producers and consumers synchronize independently: pushes contend only with other pushes (on the tail cursor) and
/// pops only with other pops (on the head cursor). Waiting for a free or filled slot is done on semaphores, so a
/// blocked caller is parked rather than spinning.
///
/// At rest, `0 <= len <= capacity` and `tail == (head + len) % capacity`.
pub struct AdmissionQueue<T> {
    slots: Box<[Mutex<Option<T>>]>,
    free: Semaphore,
    filled: Semaphore,
    head: Mutex<usize>,
    tail: Mutex<usize>,
    count: AtomicUsize,
}

impl<T> AdmissionQueue<T> {
    /// Creates a new `AdmissionQueue` with the given capacity.
    ///
    /// A capacity of zero is bumped to one, as a queue that can never admit anything would deadlock every caller.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();

        Self {
            slots,
            free: Semaphore::new(capacity),
            filled: Semaphore::new(0),
            head: Mutex::new(0),
            tail: Mutex::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Returns the capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of items currently in the queue.
    pub fn len(&self) -> usize {
        self.count.load(Acquire)
    }

    /// Returns `true` if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes an item onto the tail of the queue, waiting for a free slot if the queue is full.
    ///
    /// # Errors
    ///
    /// If the queue has been closed, an error is returned.
    pub async fn push(&self, item: T) -> Result<(), AdmissionError> {
        let permit = self.free.acquire().await.map_err(|_| AdmissionError::Closed)?;
        permit.forget();
        self.insert(item);

        Ok(())
    }

    /// Pushes an item onto the tail of the queue, waiting at most `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// If no slot frees up in time, or the queue has been closed, an error is returned.
    pub async fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), AdmissionError> {
        match tokio::time::timeout(timeout, self.push(item)).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::TimedOut { timeout }),
        }
    }

    /// Pops an item from the head of the queue, waiting for one to be pushed if the queue is empty.
    ///
    /// Returns `None` only if the queue was closed while empty.
    pub async fn pop(&self) -> Option<T> {
        let permit = self.filled.acquire().await.ok()?;
        permit.forget();

        Some(self.remove())
    }

    /// Pops an item from the head of the queue if one is available, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.filled.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Some(self.remove())
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Admits an item, returning a slot that pops an item from the queue when dropped.
    ///
    /// The slot owns a handle to the queue, so it can be moved into whatever work the admitted request hands off to
    /// and outlive the caller.
    ///
    /// # Errors
    ///
    /// If no slot frees up within `timeout`, or the queue has been closed, an error is returned.
    pub async fn admit(self: &Arc<Self>, item: T, timeout: Duration) -> Result<AdmissionSlot<T>, AdmissionError> {
        self.push_timeout(item, timeout).await?;
        Ok(AdmissionSlot {
            queue: Arc::clone(self),
        })
    }

    /// Closes the queue to new pushes.
    ///
    /// Callers currently waiting for a free slot are woken up with an error. Items already in the queue can still be
    /// popped.
    pub fn close(&self) {
        self.free.close();
    }

    fn insert(&self, item: T) {
        // The slot is written while still holding the tail lock so that slots become visible to consumers in the same
        // order their indices were handed out.
        let mut tail = lock(&self.tail);
        *lock(&self.slots[*tail]) = Some(item);
        *tail = (*tail + 1) % self.slots.len();
        self.count.fetch_add(1, AcqRel);
        drop(tail);

        self.filled.add_permits(1);
    }

    fn remove(&self) -> T {
        let mut head = lock(&self.head);
        let item = lock(&self.slots[*head]).take();
        *head = (*head + 1) % self.slots.len();
        self.count.fetch_sub(1, AcqRel);
        drop(head);

        self.free.add_permits(1);

        // A filled permit is only ever issued after its slot has been written, and slot indices are consumed in the
        // same order they were produced.
        match item {
            Some(item) => item,
            None => unreachable!("admission queue slot was empty despite holding a filled permit"),
        }
    }
}

/// An admitted request's hold on the admission queue.
///
/// Dropping the slot pops the queue, restoring one unit of capacity, regardless of how the request finished.
pub struct AdmissionSlot<T> {
    queue: Arc<AdmissionQueue<T>>,
}

impl<T> Drop for AdmissionSlot<T> {
    fn drop(&mut self) {
        // Every live slot accounts for one filled permit, so this never comes up empty.
        let _ = self.queue.try_pop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
