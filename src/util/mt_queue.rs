use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A multi-producer, single-consumer queue.
///
/// Producers lock, push, and publish the new size; the consumer may observe
/// the size lock-free and drain under the lock. This is the handoff channel
/// between background threads and the dispatch thread.
pub(crate) struct MtQueue<T> {
    queue: Mutex<VecDeque<T>>,
    size: AtomicUsize,
}

impl<T> MtQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            size: AtomicUsize::new(0),
        }
    }

    /// Push an item. Callable from any thread.
    pub fn push(&self, item: T) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(item);
        self.size.store(queue.len(), Ordering::Release);
    }

    /// Observe the queue size without taking the lock.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Pop one item.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock().unwrap();
        let item = queue.pop_front();
        self.size.store(queue.len(), Ordering::Release);
        item
    }

    /// Drain all currently queued items.
    pub fn drain(&self) -> VecDeque<T> {
        let mut queue = self.queue.lock().unwrap();
        let items = std::mem::take(&mut *queue);
        self.size.store(0, Ordering::Release);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mpsc_ordering() {
        let q = Arc::new(MtQueue::new());

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        q.push((t, i));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(q.size(), 400);

        // Per-producer FIFO order is preserved.
        let mut last = [-1i32; 4];
        while let Some((t, i)) = q.pop() {
            assert!(i > last[t]);
            last[t] = i;
        }
        assert_eq!(q.size(), 0);
    }
}
