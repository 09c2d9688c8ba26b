use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Thread-safe double-ended queue.
///
/// A single lock guards the underlying sequence; contention is bounded by
/// the worker count, and exact FIFO-from-front / LIFO-from-back semantics
/// are what the scheduler relies on. `len` is a relaxed hint only.
pub struct ConcurrentDeque<T> {
  deque: Mutex<VecDeque<T>>,
  len: AtomicUsize,
}

impl<T> ConcurrentDeque<T> {
  pub fn new() -> ConcurrentDeque<T> {
    ConcurrentDeque {
      deque: Mutex::new(VecDeque::new()),
      len: AtomicUsize::new(0),
    }
  }

  pub fn push_back(&self, value: T) {
    let mut deque = self.deque.lock();
    deque.push_back(value);
    self.len.fetch_add(1, Ordering::Relaxed);
  }

  pub fn push_front(&self, value: T) {
    let mut deque = self.deque.lock();
    deque.push_front(value);
    self.len.fetch_add(1, Ordering::Relaxed);
  }

  #[must_use]
  pub fn pop_back(&self) -> Option<T> {
    let mut deque = self.deque.lock();
    let value = deque.pop_back()?;
    self.len.fetch_sub(1, Ordering::Relaxed);
    Some(value)
  }

  #[must_use]
  pub fn pop_front(&self) -> Option<T> {
    let mut deque = self.deque.lock();
    let value = deque.pop_front()?;
    self.len.fetch_sub(1, Ordering::Relaxed);
    Some(value)
  }

  /// Approximate number of queued elements, for scheduling heuristics only.
  pub fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T> Default for ConcurrentDeque<T> {
  fn default() -> ConcurrentDeque<T> {
    ConcurrentDeque::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn back_is_lifo() {
    let q = ConcurrentDeque::new();
    q.push_back(1);
    q.push_back(2);
    q.push_back(3);
    assert_eq!(q.pop_back(), Some(3));
    assert_eq!(q.pop_back(), Some(2));
    assert_eq!(q.pop_back(), Some(1));
    assert_eq!(q.pop_back(), None);
  }

  #[test]
  fn front_is_fifo() {
    let q = ConcurrentDeque::new();
    q.push_back(1);
    q.push_back(2);
    q.push_back(3);
    assert_eq!(q.pop_front(), Some(1));
    assert_eq!(q.pop_front(), Some(2));
    assert_eq!(q.pop_front(), Some(3));
    assert_eq!(q.pop_front(), None);
  }

  #[test]
  fn push_front_jumps_the_queue() {
    let q = ConcurrentDeque::new();
    q.push_back(1);
    q.push_front(2);
    assert_eq!(q.pop_front(), Some(2));
    assert_eq!(q.pop_front(), Some(1));
  }

  #[test]
  fn len_tracks_ops() {
    let q = ConcurrentDeque::new();
    assert!(q.is_empty());
    q.push_back(1);
    q.push_front(2);
    assert_eq!(q.len(), 2);
    let _ = q.pop_back();
    assert_eq!(q.len(), 1);
  }

  #[test]
  fn concurrent_producers_and_consumers() {
    use std::sync::Arc;

    let q = Arc::new(ConcurrentDeque::new());
    let mut handles = Vec::new();
    for _ in 0..4 {
      let q = q.clone();
      handles.push(std::thread::spawn(move || {
        for i in 0..1000 {
          q.push_back(i);
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }

    let mut popped = 0;
    while q.pop_front().is_some() {
      popped += 1;
    }
    assert_eq!(popped, 4000);
  }
}
