use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify, Semaphore};

/// Default number of requests waiting for a worker loop
pub const DEFAULT_CAPACITY: usize = 512;

/// Bounded FIFO shared by the worker loops
///
/// `push` waits while the queue is full. After `close` pushes are
/// refused and `pop` drains what is left, then returns `None`.
pub struct RequestQueue<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    slots: Semaphore,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            slots: Semaphore::new(capacity),
        }
    }

    /// Returns the item back when the queue is closed
    pub async fn push(&self, item: T) -> Result<(), T> {
        match self.slots.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(item),
        }
        self.queue.lock().await.push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn pop(&self) -> Option<T> {
        loop {
            // register before checking so a close in between is not missed
            let notified = self.notify.notified();
            if let Some(item) = self.queue.lock().await.pop_front() {
                self.slots.add_permits(1);
                return Some(item);
            }
            if self.slots.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.slots.close();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_and_drain_after_close() {
        let queue = RequestQueue::new(4);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        queue.close();

        assert_eq!(queue.push(3).await, Err(3));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_push_waits_when_full() {
        let queue = Arc::new(RequestQueue::new(1));
        queue.push(1).await.unwrap();

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pusher.is_finished());

        assert_eq!(queue.pop().await, Some(1));
        pusher.await.unwrap().unwrap();
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_pop() {
        let queue = Arc::new(RequestQueue::<u32>::new(1));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(popper.await.unwrap(), None);
    }
}
