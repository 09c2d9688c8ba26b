// extra doc:
// The scheduling layout mirrors classic work-stealing runtimes: every worker
// owns a deque, pushes and pops its own work LIFO at the back, and thieves
// take FIFO from the front. A task may suspend itself with
// `WorkerHandle::get` and keep executing other queued work in the meantime,
// so waiting never parks the OS thread.

use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{trace, warn};
use once_cell::sync::Lazy;

use crate::deque::ConcurrentDeque;

// payloads up to this many words are stored inline in the task wrapper;
// anything bigger goes through a box
const SMALL_WORDS: usize = 7;

type Storage = MaybeUninit<[usize; SMALL_WORDS]>;

const fn fits_inline<F>() -> bool {
  mem::size_of::<F>() <= mem::size_of::<Storage>()
    && mem::align_of::<F>() <= mem::align_of::<Storage>()
}

struct TaskVtable {
  run: unsafe fn(*mut u8, &mut WorkerHandle),
  drop: unsafe fn(*mut u8),
}

static TASK_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Move-only type-erased callable invoked with a worker handle.
///
/// Consuming `run` leaves nothing behind to drop; a task that is dropped
/// without running releases its payload (and thereby any result channel it
/// was carrying).
pub struct Task {
  id: usize,
  vtable: Option<&'static TaskVtable>,
  storage: Storage,
}

unsafe impl Send for Task {}

impl Task {
  pub fn new<F>(f: F) -> Task
  where
    F: FnOnce(&mut WorkerHandle) + Send + 'static,
  {
    let id = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut storage = Storage::uninit();
    let vtable = if fits_inline::<F>() {
      unsafe { ptr::write(storage.as_mut_ptr() as *mut F, f) };
      &InlineModel::<F>::VTABLE
    } else {
      unsafe { ptr::write(storage.as_mut_ptr() as *mut Box<F>, Box::new(f)) };
      &BoxedModel::<F>::VTABLE
    };
    Task {
      id,
      vtable: Some(vtable),
      storage,
    }
  }

  // pair a returning closure with the channel its future reads; panics are
  // caught here and re-raised on the receiving side
  fn returning<F, R>(f: F) -> (Task, JobFuture<R>)
  where
    F: FnOnce(&mut WorkerHandle) -> R + Send + 'static,
    R: Send + 'static,
  {
    let (tx, rx) = bounded(1);
    let task = Task::new(move |h: &mut WorkerHandle| {
      let result = panic::catch_unwind(AssertUnwindSafe(|| f(h)));
      let _ = tx.send(result);
    });
    (task, JobFuture { rx })
  }

  pub fn run(mut self, h: &mut WorkerHandle) {
    if let Some(vtable) = self.vtable.take() {
      trace!("{:?} is running on {:?}", self, h);
      unsafe { (vtable.run)(self.storage.as_mut_ptr() as *mut u8, h) }
    }
  }
}

impl Drop for Task {
  fn drop(&mut self) {
    if let Some(vtable) = self.vtable.take() {
      unsafe { (vtable.drop)(self.storage.as_mut_ptr() as *mut u8) }
    }
  }
}

impl std::fmt::Debug for Task {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&format!("T({})", self.id))
  }
}

struct InlineModel<F>(PhantomData<F>);

impl<F> InlineModel<F>
where
  F: FnOnce(&mut WorkerHandle) + Send + 'static,
{
  const VTABLE: TaskVtable = TaskVtable {
    run: Self::run,
    drop: Self::drop_in_place,
  };

  unsafe fn run(p: *mut u8, h: &mut WorkerHandle) {
    let f = unsafe { ptr::read(p as *mut F) };
    f(h);
  }

  unsafe fn drop_in_place(p: *mut u8) {
    unsafe { ptr::drop_in_place(p as *mut F) }
  }
}

struct BoxedModel<F>(PhantomData<F>);

impl<F> BoxedModel<F>
where
  F: FnOnce(&mut WorkerHandle) + Send + 'static,
{
  const VTABLE: TaskVtable = TaskVtable {
    run: Self::run,
    drop: Self::drop_in_place,
  };

  unsafe fn run(p: *mut u8, h: &mut WorkerHandle) {
    let f = unsafe { ptr::read(p as *mut Box<F>) };
    f(h);
  }

  unsafe fn drop_in_place(p: *mut u8) {
    unsafe { ptr::drop_in_place(p as *mut Box<F>) }
  }
}

/// Result channel of a returning task.
///
/// A future obtained after shutdown is invalid: it never becomes ready and
/// waiting on it yields `None`.
pub struct JobFuture<R> {
  rx: Receiver<thread::Result<R>>,
}

impl<R> JobFuture<R> {
  fn invalid() -> JobFuture<R> {
    let (_, rx) = bounded(1);
    JobFuture { rx }
  }

  /// Block the calling OS thread until the result arrives. `None` when the
  /// task was dropped without running (submission raced shutdown).
  ///
  /// Inside a task body use [`WorkerHandle::get`] instead, which keeps the
  /// worker executing queued work while it waits.
  pub fn wait(self) -> Option<R> {
    match self.rx.recv() {
      Ok(result) => Some(unwrap_task_result(result)),
      Err(_) => None,
    }
  }
}

fn unwrap_task_result<R>(result: thread::Result<R>) -> R {
  match result {
    Ok(value) => value,
    // the task panicked; surface it at the point that asked for the result
    Err(payload) => panic::resume_unwind(payload),
  }
}

struct WorkerRecord {
  run_stack: ConcurrentDeque<Task>,
  stop: AtomicBool,
  // notification channel only: dispatch feeds it, but the hot loop never
  // sleeps on it (workers busy-idle with yield)
  wake_tx: Sender<()>,
  wake_rx: Receiver<()>,
}

impl WorkerRecord {
  fn new() -> WorkerRecord {
    let (wake_tx, wake_rx) = bounded(1);
    WorkerRecord {
      run_stack: ConcurrentDeque::new(),
      stop: AtomicBool::new(false),
      wake_tx,
      wake_rx,
    }
  }

  fn notify_work(&self) {
    let _ = self.wake_tx.try_send(());
  }
}

struct Inner {
  workers: Vec<WorkerRecord>,
  is_done: AtomicBool,
  ticket: AtomicUsize,
  enable_stealing: bool,
}

impl Inner {
  fn is_done(&self) -> bool {
    self.is_done.load(Ordering::Acquire)
  }

  fn dispatch(&self, task: Task) {
    let idx = self.ticket.load(Ordering::Acquire);
    let n = self.workers.len();
    let worker = &self.workers[idx % n];
    trace!("{:?} dispatched to W({})", task, idx % n);
    worker.run_stack.push_front(task);
    worker.notify_work();
    // a lost race here just skews placement off round-robin for one
    // submission; the stealers even it out
    let _ = self
      .ticket
      .compare_exchange(idx, idx + 1, Ordering::AcqRel, Ordering::Acquire);
  }

  // try each other worker round-robin starting after the caller, taking
  // from the front: the opposite end from the owner's LIFO pops
  fn steal(&self, index: usize) -> Option<Task> {
    let n = self.workers.len();
    for i in index + 1..index + n {
      if let Some(task) = self.workers[i % n].run_stack.pop_front() {
        return Some(task);
      }
    }
    None
  }
}

/// Options for [`Executor::with_options`].
pub struct ExecutorOptions {
  pub parallelism: usize,
  pub enable_stealing: bool,
  /// Pin each worker to a core (`index mod core_count`). When core
  /// enumeration is unavailable the pool runs unpinned; a failed pin on an
  /// enumerated core is fatal.
  pub pin_threads: bool,
}

impl Default for ExecutorOptions {
  fn default() -> ExecutorOptions {
    ExecutorOptions {
      parallelism: num_cpus::get().max(1),
      enable_stealing: true,
      pin_threads: true,
    }
  }
}

/// Fixed pool of workers executing tasks with work stealing.
pub struct Executor {
  inner: Arc<Inner>,
  threads: Vec<thread::JoinHandle<()>>,
}

impl Executor {
  pub fn new(parallelism: usize, enable_stealing: bool) -> Executor {
    Executor::with_options(ExecutorOptions {
      parallelism,
      enable_stealing,
      ..ExecutorOptions::default()
    })
  }

  pub fn with_options(options: ExecutorOptions) -> Executor {
    let parallelism = options.parallelism.max(1);
    let workers = (0..parallelism).map(|_| WorkerRecord::new()).collect();
    let inner = Arc::new(Inner {
      workers,
      is_done: AtomicBool::new(false),
      ticket: AtomicUsize::new(0),
      enable_stealing: options.enable_stealing,
    });

    let threads = (0..parallelism)
      .map(|index| {
        let inner = inner.clone();
        let pin = options.pin_threads;
        thread::Builder::new()
          .name(format!("papso-worker-{}", index))
          .spawn(move || worker_main(inner, index, pin))
          .expect("failed to spawn worker thread")
      })
      .collect();

    Executor { inner, threads }
  }

  /// Submit a fire-and-forget task. No-op after [`Executor::done`].
  pub fn execute<F>(&self, f: F)
  where
    F: FnOnce(&mut WorkerHandle) + Send + 'static,
  {
    if self.inner.is_done() {
      return;
    }
    self.inner.dispatch(Task::new(f));
  }

  /// Submit a returning task. After [`Executor::done`] the returned future
  /// is invalid and never becomes ready.
  #[must_use]
  pub fn execute_return<F, R>(&self, f: F) -> JobFuture<R>
  where
    F: FnOnce(&mut WorkerHandle) -> R + Send + 'static,
    R: Send + 'static,
  {
    if self.inner.is_done() {
      return JobFuture::invalid();
    }
    let (task, fut) = Task::returning(f);
    self.inner.dispatch(task);
    fut
  }

  /// Halt new dispatches. Running tasks are not preempted; they observe
  /// shutdown at their next re-dispatch point.
  pub fn done(&self) {
    if !self.inner.is_done.swap(true, Ordering::AcqRel) {
      trace!("executor is done");
    }
  }

  pub fn is_done(&self) -> bool {
    self.inner.is_done()
  }

  pub fn parallelism(&self) -> usize {
    self.inner.workers.len()
  }
}

impl Drop for Executor {
  fn drop(&mut self) {
    self.done();
    for worker in &self.inner.workers {
      worker.stop.store(true, Ordering::Release);
    }
    for t in self.threads.drain(..) {
      let _ = t.join();
    }
  }
}

// cached once: every worker indexes into the same enumeration
static CORE_IDS: Lazy<Option<Vec<core_affinity::CoreId>>> =
  Lazy::new(core_affinity::get_core_ids);

fn pin_current_thread(index: usize) {
  match CORE_IDS.as_ref() {
    Some(ids) if !ids.is_empty() => {
      let id = ids[index % ids.len()];
      if !core_affinity::set_for_current(id) {
        panic!("failed to set thread affinity for worker {}", index);
      }
    }
    _ => warn!("core enumeration unavailable, worker {} runs unpinned", index),
  }
}

fn worker_main(inner: Arc<Inner>, index: usize, pin: bool) {
  if pin {
    pin_current_thread(index);
  }
  trace!("W({}) is running", index);

  let mut handle = WorkerHandle {
    inner: inner.clone(),
    index,
  };

  while !inner.is_done() && !inner.workers[index].stop.load(Ordering::Acquire) {
    // own work first, newest first
    if let Some(task) = inner.workers[index].run_stack.pop_back() {
      task.run(&mut handle);
      continue;
    }

    if inner.enable_stealing {
      if let Some(task) = inner.steal(index) {
        trace!("W({}) stole {:?}", index, task);
        task.run(&mut handle);
        continue;
      }
    }

    // nothing to do: drain stale wakeups and give up the time slice
    let _ = inner.workers[index].wake_rx.try_recv();
    thread::yield_now();
  }

  trace!("W({}) is stopped", index);
}

/// Working context handed to every task; lets the task submit children to
/// the current worker and wait for results without blocking the thread.
pub struct WorkerHandle {
  inner: Arc<Inner>,
  index: usize,
}

impl WorkerHandle {
  fn record(&self) -> &WorkerRecord {
    &self.inner.workers[self.index]
  }

  pub fn index(&self) -> usize {
    self.index
  }

  /// Submit a child task to the current worker. It lands at the back of the
  /// deque, so the owner takes it next (depth-first); thieves see it last.
  pub fn execute<F>(&self, f: F)
  where
    F: FnOnce(&mut WorkerHandle) + Send + 'static,
  {
    if self.inner.is_done() {
      return;
    }
    self.record().run_stack.push_back(Task::new(f));
  }

  #[must_use]
  pub fn execute_return<F, R>(&self, f: F) -> JobFuture<R>
  where
    F: FnOnce(&mut WorkerHandle) -> R + Send + 'static,
    R: Send + 'static,
  {
    if self.inner.is_done() {
      return JobFuture::invalid();
    }
    let (task, fut) = Task::returning(f);
    self.record().run_stack.push_back(task);
    fut
  }

  /// Suspend the current task until `fut` is ready, executing other queued
  /// work in the meantime. `None` if the future is invalid.
  pub fn get<R>(&mut self, fut: JobFuture<R>) -> Option<R> {
    loop {
      match fut.rx.try_recv() {
        Ok(result) => return Some(unwrap_task_result(result)),
        Err(TryRecvError::Disconnected) => return None,
        Err(TryRecvError::Empty) => {
          // re-enter the scheduler: own deque first, then steal; poll
          // again right away, the loop does not yield
          if let Some(task) = self.record().run_stack.pop_back() {
            task.run(self);
          } else if let Some(task) = self.inner.steal(self.index) {
            task.run(self);
          }
        }
      }
    }
  }
}

impl std::fmt::Debug for WorkerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&format!("W({})", self.index))
  }
}
