//! Parallel asynchronous PSO core.
//!
//! The swarm is split into contiguous subswarms, one task per subswarm per
//! iteration slice. A particle is only ever mutated by the task owning its
//! subswarm; everything other tasks may see goes through the published
//! per-particle atomics and SPMC position buffers. Tasks re-submit
//! themselves through the worker handle after each slice, so the pool can
//! re-balance between slices by stealing.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::executor::{Executor, WorkerHandle};
use crate::rng::CanonicalRng;
use crate::spmc::SpmcBuffer;

// Clerc-Kennedy constriction coefficients
const INERTIA: f64 = 0.7298;
const ACCELERATION: f64 = 1.49618;

/// Objective to minimize over an ordered sequence of coordinates. Must be
/// re-entrant: it is called concurrently from every worker.
pub type ObjectiveFn = fn(&[f64]) -> f64;

/// An optimization problem: objective, homogeneous box bounds, dimension.
#[derive(Clone, Copy, Debug)]
pub struct Problem {
  pub function: ObjectiveFn,
  pub bounds: (f64, f64),
  pub dimension: usize,
}

#[derive(Debug, Error)]
pub enum PapsoError {
  #[error("neighborhood size {neighbors} exceeds swarm size {swarm}")]
  NeighborhoodTooLarge { neighbors: usize, swarm: usize },
  #[error("fork count must be at least 1")]
  ZeroForks,
  #[error("iterations per task must be at least 1")]
  ZeroIterationsPerTask,
}

/// Half-open interval, `[first, second)`.
pub type IndexRange = (usize, usize);

// f64 over an atomic u64; a published best value is read by every neighbor
// scan, so each one lives on its own cache line (see the CachePadded
// wrapper at the use site)
struct AtomicF64(AtomicU64);

impl AtomicF64 {
  fn new(value: f64) -> AtomicF64 {
    AtomicF64(AtomicU64::new(value.to_bits()))
  }

  fn load(&self) -> f64 {
    f64::from_bits(self.0.load(Ordering::Acquire))
  }

  fn store(&self, value: f64) {
    self.0.store(value.to_bits(), Ordering::Release)
  }
}

struct Particle {
  value: f64,
  best_value: f64,
  velocity: Vec<f64>,
  position: Vec<f64>,
  best_position: Vec<f64>,
}

// completion count of live forks; the mutex also orders every fork's final
// writes before the waiter's final scan
struct Completion {
  forks: Mutex<usize>,
  cv: Condvar,
}

struct ForkTracer {
  completion: Arc<Completion>,
}

impl ForkTracer {
  fn new(completion: Arc<Completion>) -> ForkTracer {
    *completion.forks.lock() += 1;
    ForkTracer { completion }
  }
}

impl Drop for ForkTracer {
  fn drop(&mut self) {
    let mut forks = self.completion.forks.lock();
    *forks -= 1;
    let finished = *forks == 0;
    drop(forks);
    if finished {
      self.completion.cv.notify_one();
    }
  }
}

// neighborhood best: either a direct borrow of a particle this task owns,
// or a scoped snapshot of a foreign particle's published best
enum Lbest<'a, B>
where
  B: SpmcBuffer<Vec<f64>> + 'a,
{
  Local(&'a Vec<f64>),
  Remote(B::Viewer<'a>),
}

impl<'a, B> Deref for Lbest<'a, B>
where
  B: SpmcBuffer<Vec<f64>> + 'a,
{
  type Target = Vec<f64>;

  fn deref(&self) -> &Vec<f64> {
    match self {
      Lbest::Local(v) => v,
      Lbest::Remote(v) => &**v,
    }
  }
}

/// Swarm state machine. `B` is the buffer used to publish best positions;
/// `NEIGHBORS` is the ring-neighborhood width, `SWARM` the particle count,
/// `ITERATIONS` the total iteration count.
pub struct Papso<B, const NEIGHBORS: usize, const SWARM: usize, const ITERATIONS: usize> {
  function: ObjectiveFn,
  dimension: usize,
  min: f64,
  max: f64,
  iter_per_task: usize,

  // particles and rngs are single-writer: each cell is touched only by the
  // task owning the enclosing subswarm range / fork index
  particles: Vec<UnsafeCell<Particle>>,
  rngs: Vec<UnsafeCell<CanonicalRng>>,

  // published bests, readable from every subswarm
  best_values: Vec<CachePadded<AtomicF64>>,
  best_positions: Vec<B>,

  completion: Arc<Completion>,
}

unsafe impl<B, const NB: usize, const S: usize, const I: usize> Send for Papso<B, NB, S, I> where
  B: SpmcBuffer<Vec<f64>>
{
}
unsafe impl<B, const NB: usize, const S: usize, const I: usize> Sync for Papso<B, NB, S, I> where
  B: SpmcBuffer<Vec<f64>>
{
}

impl<B, const NEIGHBORS: usize, const SWARM: usize, const ITERATIONS: usize>
  Papso<B, NEIGHBORS, SWARM, ITERATIONS>
where
  B: SpmcBuffer<Vec<f64>> + 'static,
{
  /// Run the optimizer on `etor`: `fork_count` subswarms, each advanced
  /// `iter_per_task` iterations per dispatch. Returns a handle that blocks
  /// until completion.
  pub fn parallel_async_pso(
    etor: &Executor,
    fork_count: usize,
    iter_per_task: usize,
    problem: &Problem,
  ) -> Result<OptimizeHandle<B, NEIGHBORS, SWARM, ITERATIONS>, PapsoError> {
    Self::start(etor, fork_count, iter_per_task, problem, None)
  }

  /// Like [`Papso::parallel_async_pso`] but with deterministic per-fork
  /// seeding, for replaying a run.
  pub fn parallel_async_pso_seeded(
    etor: &Executor,
    fork_count: usize,
    iter_per_task: usize,
    problem: &Problem,
    seed: u64,
  ) -> Result<OptimizeHandle<B, NEIGHBORS, SWARM, ITERATIONS>, PapsoError> {
    Self::start(etor, fork_count, iter_per_task, problem, Some(seed))
  }

  fn start(
    etor: &Executor,
    fork_count: usize,
    iter_per_task: usize,
    problem: &Problem,
    seed: Option<u64>,
  ) -> Result<OptimizeHandle<B, NEIGHBORS, SWARM, ITERATIONS>, PapsoError> {
    let state = Self::new(problem, fork_count, iter_per_task, seed)?;
    state.initialize();
    debug!(
      "papso: {} particles, {} forks, {} iterations in slices of {}",
      SWARM, fork_count, ITERATIONS, iter_per_task
    );

    let fork_size = (SWARM + fork_count - 1) / fork_count;
    for k in 0..fork_count {
      let first = k * fork_size;
      let second = ((k + 1) * fork_size).min(SWARM);
      if first >= second {
        // more forks than particles; the excess subswarms are empty
        continue;
      }
      state.spawn(etor, (first, second), k);
    }

    Ok(OptimizeHandle { state })
  }

  fn new(
    problem: &Problem,
    fork_count: usize,
    iter_per_task: usize,
    seed: Option<u64>,
  ) -> Result<Arc<Self>, PapsoError> {
    if NEIGHBORS > SWARM {
      return Err(PapsoError::NeighborhoodTooLarge {
        neighbors: NEIGHBORS,
        swarm: SWARM,
      });
    }
    if fork_count == 0 {
      return Err(PapsoError::ZeroForks);
    }
    if iter_per_task == 0 {
      return Err(PapsoError::ZeroIterationsPerTask);
    }

    let dimension = problem.dimension;
    let particles = (0..SWARM)
      .map(|_| {
        UnsafeCell::new(Particle {
          value: f64::MAX,
          best_value: f64::MAX,
          velocity: vec![0.0; dimension],
          position: vec![0.0; dimension],
          best_position: vec![0.0; dimension],
        })
      })
      .collect();
    let best_values = (0..SWARM)
      .map(|_| CachePadded::new(AtomicF64::new(f64::MAX)))
      .collect();
    let best_positions = (0..SWARM).map(|_| B::new(vec![0.0; dimension])).collect();
    let rngs = (0..fork_count)
      .map(|k| {
        UnsafeCell::new(match seed {
          Some(s) => CanonicalRng::seed_from_u64(s.wrapping_add(k as u64)),
          None => CanonicalRng::from_entropy(),
        })
      })
      .collect();

    Ok(Arc::new(Papso {
      function: problem.function,
      dimension,
      min: problem.bounds.0,
      max: problem.bounds.1,
      iter_per_task,
      particles,
      rngs,
      best_values,
      best_positions,
      completion: Arc::new(Completion {
        forks: Mutex::new(0),
        cv: Condvar::new(),
      }),
    }))
  }

  fn sample(&self, rng: &mut CanonicalRng) -> f64 {
    self.min + rng.draw() * (self.max - self.min)
  }

  // runs before any task is dispatched, so the state is still exclusive
  fn initialize(&self) {
    let rng = unsafe { &mut *self.rngs[0].get() };
    for i in 0..SWARM {
      let p = self.particles[i].get();
      unsafe {
        for d in 0..self.dimension {
          let x = self.sample(rng);
          (&mut (*p).position)[d] = x;
          (&mut (*p).best_position)[d] = x;
          // a small initial motion centered near the starting point
          (&mut (*p).velocity)[d] = (self.sample(rng) - x) / 2.0;
        }
        let value = (self.function)(&(*p).position);
        (*p).value = value;
        (*p).best_value = value;
        self.best_values[i].store(value);
        self.best_positions[i].put((*p).best_position.clone());
      }
    }
  }

  /// Best known value/position over the neighborhood ring of `idx`.
  ///
  /// Neighbors inside this task's own `range` are read directly; foreign
  /// neighbors through their published atomics, and the winning foreign
  /// position through a buffer snapshot. A foreign pair is only eventually
  /// consistent: the position snapshot may lag the value that won the scan.
  fn lbest(&self, idx: usize, range: IndexRange) -> Lbest<'_, B> {
    let in_range = |i: usize| range.0 <= i && i < range.1;

    let mut lbest_idx = idx;
    let mut lbest_val = unsafe { (*self.particles[idx].get()).best_value };
    let max_offset = (NEIGHBORS / 2) as isize;

    for offset in -max_offset..=max_offset {
      // idx + SWARM keeps the sum positive before the wrap
      let neighbor = ((idx + SWARM) as isize + offset) as usize % SWARM;
      let v = if in_range(neighbor) {
        unsafe { (*self.particles[neighbor].get()).best_value }
      } else {
        self.best_values[neighbor].load()
      };
      if v < lbest_val {
        lbest_val = v;
        lbest_idx = neighbor;
      }
    }

    if in_range(lbest_idx) {
      Lbest::Local(unsafe { &(*self.particles[lbest_idx].get()).best_position })
    } else {
      Lbest::Remote(self.best_positions[lbest_idx].get())
    }
  }

  // velocity and position update with box confinement; two fresh uniform
  // draws per dimension
  fn move_particle(&self, idx: usize, lbest: &[f64], rng: &mut CanonicalRng) {
    let p = self.particles[idx].get();
    // lbest may alias this particle's own best_position; velocity and
    // position are disjoint fields, so the projections below never overlap
    unsafe {
      let velocity = &mut (*p).velocity;
      let position = &mut (*p).position;
      let pbest = &(*p).best_position;

      for d in 0..self.dimension {
        let vi = INERTIA * velocity[d]
          + ACCELERATION * rng.draw() * (pbest[d] - position[d])
          + ACCELERATION * rng.draw() * (lbest[d] - position[d]);
        let xi = position[d] + vi;

        if xi < self.min {
          position[d] = self.min;
          velocity[d] = 0.0;
        } else if xi > self.max {
          position[d] = self.max;
          velocity[d] = 0.0;
        } else {
          position[d] = xi;
          velocity[d] = vi;
        }
      }
    }
  }

  // evaluate and, on improvement, update the private best and publish it;
  // NaN never compares less, so it cannot displace a finite incumbent
  fn evaluate_particle(&self, i: usize) {
    let p = self.particles[i].get();
    unsafe {
      let value = (self.function)(&(*p).position);
      (*p).value = value;
      if value < (*p).best_value {
        (*p).best_value = value;
        let position = &(*p).position;
        let best_position = &mut (*p).best_position;
        best_position.clone_from(position);
        self.best_values[i].store(value);
        self.best_positions[i].put(best_position.clone());
      }
    }
  }

  fn iteration_range(&self, first: usize) -> IndexRange {
    (first, (first + self.iter_per_task).min(ITERATIONS))
  }

  fn spawn(self: &Arc<Self>, etor: &Executor, subswarm: IndexRange, fork: usize) {
    let state = self.clone();
    let tracer = ForkTracer::new(self.completion.clone());
    let iterations = self.iteration_range(0);
    etor.execute(move |h| {
      state.run_slice(subswarm, iterations, fork, h);
      drop(tracer);
    });
  }

  // one dispatch: advance every owned particle through the iteration
  // slice, then hand the next slice back to the scheduler
  fn run_slice(
    self: &Arc<Self>,
    subswarm: IndexRange,
    iterations: IndexRange,
    fork: usize,
    h: &mut WorkerHandle,
  ) {
    let rng = unsafe { &mut *self.rngs[fork].get() };

    for _ in iterations.0..iterations.1 {
      for j in subswarm.0..subswarm.1 {
        {
          let lbest = self.lbest(j, subswarm);
          self.move_particle(j, &lbest, rng);
        }
        self.evaluate_particle(j);
      }
    }

    if iterations.1 < ITERATIONS {
      // re-submit through the worker handle: the successor lands LIFO on
      // the same worker unless a thief gets there first
      let next = self.iteration_range(iterations.1);
      trace!(
        "fork {} re-submitting iterations [{}, {})",
        fork, next.0, next.1
      );
      let state = self.clone();
      let tracer = ForkTracer::new(self.completion.clone());
      h.execute(move |h| {
        state.run_slice(subswarm, next, fork, h);
        drop(tracer);
      });
    }
  }

  // final scan over the published best values
  fn update_gbest(&self) -> usize {
    let mut best_idx = 0;
    let mut best_val = self.best_values[0].load();
    for i in 1..SWARM {
      let v = self.best_values[i].load();
      if v < best_val {
        best_val = v;
        best_idx = i;
      }
    }
    best_idx
  }
}

/// Owning handle on a running optimization.
///
/// Consuming [`OptimizeHandle::get`] blocks until every fork has exited,
/// scans for the global best and returns `(best_value, best_position)`.
pub struct OptimizeHandle<B, const NEIGHBORS: usize, const SWARM: usize, const ITERATIONS: usize> {
  state: Arc<Papso<B, NEIGHBORS, SWARM, ITERATIONS>>,
}

impl<B, const NEIGHBORS: usize, const SWARM: usize, const ITERATIONS: usize>
  OptimizeHandle<B, NEIGHBORS, SWARM, ITERATIONS>
where
  B: SpmcBuffer<Vec<f64>> + 'static,
{
  pub fn get(self) -> (f64, Vec<f64>) {
    {
      let mut forks = self.state.completion.forks.lock();
      while *forks > 0 {
        self.state.completion.cv.wait(&mut forks);
      }
    }

    // every fork has exited: the swarm is quiescent and safe to read
    let best = self.state.update_gbest();
    let p = unsafe { &*self.state.particles[best].get() };
    (p.best_value, p.best_position.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor::{Executor, ExecutorOptions};
  use crate::functions;
  use crate::spmc::{NaiveSpmcBuffer, VersionedBuffer};

  fn test_executor(parallelism: usize) -> Executor {
    Executor::with_options(ExecutorOptions {
      parallelism,
      enable_stealing: true,
      pin_threads: false,
    })
  }

  fn sphere_2d() -> Problem {
    Problem {
      function: functions::sphere,
      bounds: (-100.0, 100.0),
      dimension: 2,
    }
  }

  #[test]
  fn oversized_neighborhood_is_rejected() {
    let etor = test_executor(1);
    let r = Papso::<VersionedBuffer<Vec<f64>>, 8, 4, 10>::parallel_async_pso(
      &etor,
      1,
      10,
      &sphere_2d(),
    );
    assert!(matches!(
      r,
      Err(PapsoError::NeighborhoodTooLarge { neighbors: 8, swarm: 4 })
    ));
  }

  #[test]
  fn zero_forks_is_rejected() {
    let etor = test_executor(1);
    let r = Papso::<VersionedBuffer<Vec<f64>>, 2, 8, 10>::parallel_async_pso(
      &etor,
      0,
      10,
      &sphere_2d(),
    );
    assert!(matches!(r, Err(PapsoError::ZeroForks)));
  }

  #[test]
  fn single_fork_single_thread_converges() {
    let etor = test_executor(1);
    let handle = Papso::<VersionedBuffer<Vec<f64>>, 2, 10, 500>::parallel_async_pso(
      &etor,
      1,
      100,
      &sphere_2d(),
    )
    .unwrap();
    let (value, position) = handle.get();
    assert!(value < 1.0, "sphere 2d should get close to zero, got {value}");
    assert_eq!(position.len(), 2);
  }

  #[test]
  fn one_slice_covers_all_iterations() {
    // iter_per_task == total iterations: one dispatch per fork, no
    // re-submission
    let etor = test_executor(2);
    let handle = Papso::<VersionedBuffer<Vec<f64>>, 2, 10, 200>::parallel_async_pso(
      &etor,
      2,
      200,
      &sphere_2d(),
    )
    .unwrap();
    let (value, _) = handle.get();
    assert!(value.is_finite());
  }

  #[test]
  fn full_swarm_neighborhood_is_gbest_topology() {
    let etor = test_executor(2);
    let handle = Papso::<VersionedBuffer<Vec<f64>>, 10, 10, 300>::parallel_async_pso(
      &etor,
      2,
      50,
      &sphere_2d(),
    )
    .unwrap();
    let (value, _) = handle.get();
    assert!(value < 1.0, "gbest topology should converge fast, got {value}");
  }

  #[test]
  fn excess_forks_are_skipped() {
    let etor = test_executor(2);
    let handle = Papso::<VersionedBuffer<Vec<f64>>, 2, 4, 100>::parallel_async_pso(
      &etor,
      16,
      50,
      &sphere_2d(),
    )
    .unwrap();
    let (value, _) = handle.get();
    assert!(value.is_finite());
  }

  #[test]
  fn returned_position_respects_bounds() {
    let etor = test_executor(2);
    let problem = Problem {
      function: functions::rastrigin,
      bounds: (-5.12, 5.12),
      dimension: 4,
    };
    let handle = Papso::<VersionedBuffer<Vec<f64>>, 4, 16, 300>::parallel_async_pso(
      &etor, 4, 100, &problem,
    )
    .unwrap();
    let (_, position) = handle.get();
    for &x in &position {
      assert!((-5.12..=5.12).contains(&x));
    }
  }

  #[test]
  fn seeded_runs_replay_identically() {
    // one fork on one worker: a fixed seed fixes the whole trajectory
    let run = || {
      let etor = test_executor(1);
      let handle = Papso::<VersionedBuffer<Vec<f64>>, 2, 10, 400>::parallel_async_pso_seeded(
        &etor,
        1,
        100,
        &sphere_2d(),
        7,
      )
      .unwrap();
      handle.get()
    };
    let (v1, p1) = run();
    let (v2, p2) = run();
    assert_eq!(v1.to_bits(), v2.to_bits());
    assert_eq!(p1.len(), p2.len());
    for (a, b) in p1.iter().zip(&p2) {
      assert_eq!(a.to_bits(), b.to_bits());
    }
  }

  #[test]
  fn naive_buffer_backend_behaves_the_same() {
    let etor = test_executor(2);
    let handle = Papso::<NaiveSpmcBuffer<Vec<f64>>, 2, 10, 300>::parallel_async_pso(
      &etor,
      2,
      100,
      &sphere_2d(),
    )
    .unwrap();
    let (value, _) = handle.get();
    assert!(value < 1.0, "naive backend should converge too, got {value}");
  }
}
