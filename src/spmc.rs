//! Single-producer / multi-consumer versioned buffer.
//!
//! One designated producer publishes values of `T` at an arbitrary cadence;
//! any number of consumers take scoped snapshots and hold them for an
//! arbitrary time. The producer never blocks: when every candidate slot is
//! pinned by readers, the value is staged in a pending register and the next
//! departing reader publishes it.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard};

/// Publish/snapshot handoff between one writer and many readers.
///
/// The optimizer is generic over this so the lock-free buffer can be swapped
/// for [`NaiveSpmcBuffer`] when comparing behavior in tests.
pub trait SpmcBuffer<T>: Send + Sync {
  type Viewer<'a>: Deref<Target = T>
  where
    Self: 'a;

  fn new(initial: T) -> Self;

  /// Publish a new value. Single designated producer; never blocks.
  fn put(&self, value: T);

  /// Take a scoped read lease on the latest published snapshot.
  fn get(&self) -> Self::Viewer<'_>;
}

// slot counter convention:
//   -1  producer holds the slot exclusively for writing
//    0  idle, may be acquired for read or write
//   >0  that many readers hold the slot
struct Slot<T> {
  counter: CachePadded<AtomicIsize>,
  value: CachePadded<UnsafeCell<T>>,
}

impl<T> Slot<T> {
  fn new(value: T) -> Slot<T> {
    Slot {
      counter: CachePadded::new(AtomicIsize::new(0)),
      value: CachePadded::new(UnsafeCell::new(value)),
    }
  }
}

/// Lock-free-on-the-read-path SPMC buffer with `A` slots.
///
/// `read_index` names the slot readers will acquire next. Writes go to a
/// slot *other* than the one named by `read_index`, so readers holding older
/// snapshots never see a value change under them.
pub struct VersionedBuffer<T, const A: usize = 4> {
  pending: AtomicPtr<T>,
  read_index: AtomicUsize,
  slots: [Slot<T>; A],
}

unsafe impl<T: Send, const A: usize> Send for VersionedBuffer<T, A> {}
unsafe impl<T: Send + Sync, const A: usize> Sync for VersionedBuffer<T, A> {}

impl<T: Clone, const A: usize> VersionedBuffer<T, A> {
  pub fn new(initial: T) -> VersionedBuffer<T, A> {
    assert!(A >= 2, "buffer associativity must be at least 2");
    VersionedBuffer {
      pending: AtomicPtr::new(ptr::null_mut()),
      read_index: AtomicUsize::new(0),
      slots: std::array::from_fn(|_| Slot::new(initial.clone())),
    }
  }
}

impl<T, const A: usize> VersionedBuffer<T, A> {
  pub fn get(&self) -> Viewer<'_, T, A> {
    // read_index is published only after a write fully completes and
    // releases its slot, so the increment pins a consistent value
    let idx = self.read_index.load(Ordering::Acquire) % A;
    self.slots[idx].counter.fetch_add(1, Ordering::AcqRel);
    Viewer { buffer: self, idx }
  }

  pub fn put(&self, value: T) {
    // take back any staged value first so the latest write wins
    let staged = self.take_pending();

    match self.acquire_write() {
      Some(widx) => {
        unsafe {
          *self.slots[widx].value.get() = value;
        }
        self.slots[widx].counter.store(0, Ordering::Release);
        self.read_index.store(widx, Ordering::Release);
      }
      None => {
        // every candidate slot is pinned by readers; stage the value and
        // let a departing reader publish it, reusing the old allocation
        let boxed = match staged {
          Some(mut b) => {
            *b = value;
            b
          }
          None => Box::new(value),
        };
        self.arm_pending(boxed);
      }
    }
  }

  // scan [read_index + 1, read_index + A) mod A; the slot currently named
  // by read_index is never a write candidate
  fn acquire_write(&self) -> Option<usize> {
    let read_idx = self.read_index.load(Ordering::Acquire);
    for offset in 1..A {
      let widx = (read_idx + offset) % A;
      let counter = &self.slots[widx].counter;
      if counter
        .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        return Some(widx);
      }
    }
    None
  }

  fn take_pending(&self) -> Option<Box<T>> {
    if self.pending.load(Ordering::Acquire).is_null() {
      return None;
    }
    let p = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
    if p.is_null() {
      None
    } else {
      Some(unsafe { Box::from_raw(p) })
    }
  }

  fn arm_pending(&self, boxed: Box<T>) {
    let old = self.pending.swap(Box::into_raw(boxed), Ordering::AcqRel);
    if !old.is_null() {
      // displaced by a newer value; last writer wins
      drop(unsafe { Box::from_raw(old) });
    }
  }

  // called by departing readers: if a value is staged and the slot after
  // read_index is idle, install it and advance read_index; otherwise
  // re-arm the value so it is not lost
  fn proceed_pending_write(&self) {
    let value = match self.take_pending() {
      Some(v) => v,
      None => return,
    };

    let read_idx = self.read_index.load(Ordering::Acquire);
    let widx = (read_idx + 1) % A;
    let counter = &self.slots[widx].counter;
    if counter
      .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      unsafe {
        *self.slots[widx].value.get() = *value;
      }
      counter.store(0, Ordering::Release);
      self.read_index.store(widx, Ordering::Release);
    } else {
      self.arm_pending(value);
    }
  }
}

impl<T, const A: usize> Drop for VersionedBuffer<T, A> {
  fn drop(&mut self) {
    let p = *self.pending.get_mut();
    if !p.is_null() {
      drop(unsafe { Box::from_raw(p) });
    }
  }
}

impl<T, const A: usize> SpmcBuffer<T> for VersionedBuffer<T, A>
where
  T: Clone + Send + Sync,
{
  type Viewer<'a>
    = Viewer<'a, T, A>
  where
    Self: 'a;

  fn new(initial: T) -> Self {
    VersionedBuffer::new(initial)
  }

  fn put(&self, value: T) {
    VersionedBuffer::put(self, value)
  }

  fn get(&self) -> Viewer<'_, T, A> {
    VersionedBuffer::get(self)
  }
}

/// Scoped read lease on a slot of a [`VersionedBuffer`].
///
/// While the viewer is alive its slot's counter stays positive and the slot
/// cannot be rewritten. Dropping the viewer releases the slot and gives any
/// staged write a chance to publish.
pub struct Viewer<'a, T, const A: usize> {
  buffer: &'a VersionedBuffer<T, A>,
  idx: usize,
}

impl<T, const A: usize> Deref for Viewer<'_, T, A> {
  type Target = T;

  fn deref(&self) -> &T {
    // the positive counter keeps writers away from this slot
    unsafe { &*self.buffer.slots[self.idx].value.get() }
  }
}

impl<T, const A: usize> Drop for Viewer<'_, T, A> {
  fn drop(&mut self) {
    self.buffer.slots[self.idx].counter.fetch_sub(1, Ordering::AcqRel);
    self.buffer.proceed_pending_write();
  }
}

/// Reader-writer-lock reference implementation, for correctness comparison.
pub struct NaiveSpmcBuffer<T> {
  value: RwLock<T>,
}

impl<T> NaiveSpmcBuffer<T> {
  pub fn new(initial: T) -> NaiveSpmcBuffer<T> {
    NaiveSpmcBuffer {
      value: RwLock::new(initial),
    }
  }

  pub fn put(&self, value: T) {
    *self.value.write() = value;
  }

  pub fn get(&self) -> NaiveViewer<'_, T> {
    NaiveViewer {
      guard: self.value.read(),
    }
  }
}

impl<T> SpmcBuffer<T> for NaiveSpmcBuffer<T>
where
  T: Send + Sync,
{
  type Viewer<'a>
    = NaiveViewer<'a, T>
  where
    Self: 'a;

  fn new(initial: T) -> Self {
    NaiveSpmcBuffer::new(initial)
  }

  fn put(&self, value: T) {
    NaiveSpmcBuffer::put(self, value)
  }

  fn get(&self) -> NaiveViewer<'_, T> {
    NaiveSpmcBuffer::get(self)
  }
}

pub struct NaiveViewer<'a, T> {
  guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for NaiveViewer<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.guard
  }
}
