//! Parallel asynchronous particle swarm optimizer.
//!
//! A swarm of candidate solutions searches for the minimum of an objective
//! over a bounded box. Subswarms are advanced concurrently by a
//! work-stealing [`Executor`]; the only coupling between them is the
//! per-particle published best value (an atomic) and best position (an SPMC
//! [versioned buffer](spmc::VersionedBuffer) that lets readers snapshot a
//! far particle without ever locking out its owner).
//!
//! ```
//! use papso::functions;
//! use papso::{Executor, ExecutorOptions, Papso, Problem, VersionedBuffer};
//!
//! let etor = Executor::with_options(ExecutorOptions {
//!   parallelism: 2,
//!   pin_threads: false,
//!   ..ExecutorOptions::default()
//! });
//! let problem = Problem {
//!   function: functions::sphere,
//!   bounds: (-100.0, 100.0),
//!   dimension: 2,
//! };
//!
//! // 10 particles, ring neighborhood of 2, 200 iterations in slices of 50
//! let handle = Papso::<VersionedBuffer<Vec<f64>>, 2, 10, 200>::parallel_async_pso(
//!   &etor, 2, 50, &problem,
//! )
//! .unwrap();
//! let (best_value, best_position) = handle.get();
//! assert!(best_value.is_finite());
//! assert_eq!(best_position.len(), 2);
//! ```

pub mod deque;
pub mod executor;
pub mod functions;
pub mod papso;
pub mod rng;
pub mod spmc;

pub use crate::executor::{Executor, ExecutorOptions, JobFuture, WorkerHandle};
pub use crate::papso::{ObjectiveFn, OptimizeHandle, Papso, PapsoError, Problem};
pub use crate::spmc::{NaiveSpmcBuffer, SpmcBuffer, VersionedBuffer};

/// Optimizer configuration used by the command line front end: 80 particles,
/// ring neighborhood of 2, 5000 iterations.
pub type DefaultPapso = Papso<VersionedBuffer<Vec<f64>>, 2, 80, 5000>;
