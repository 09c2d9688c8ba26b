//! End-to-end convergence scenarios on the benchmark suite. Thresholds are
//! loose on purpose: the optimizer is stochastic, so each scenario takes the
//! best of a few seeded runs.

use papso::functions;
use papso::{Executor, ExecutorOptions, Papso, VersionedBuffer};

type Buf = VersionedBuffer<Vec<f64>>;

fn unpinned(parallelism: usize) -> Executor {
  Executor::with_options(ExecutorOptions {
    parallelism,
    enable_stealing: true,
    pin_threads: false,
  })
}

fn best_of<F: FnMut(u64) -> f64>(attempts: u64, mut run: F) -> f64 {
  (1..=attempts).map(&mut run).fold(f64::INFINITY, f64::min)
}

#[test]
fn sphere_converges() {
  let problem = functions::FUNCTIONS[0].problem();
  let best = best_of(3, |seed| {
    let etor = unpinned(4);
    Papso::<Buf, 2, 48, 5000>::parallel_async_pso_seeded(&etor, 4, 500, &problem, seed)
      .unwrap()
      .get()
      .0
  });
  assert!(best < 1e-6, "sphere best {best}");
}

#[test]
fn rosenbrock_converges() {
  let problem = functions::FUNCTIONS[2].problem();
  let best = best_of(3, |seed| {
    let etor = unpinned(8);
    Papso::<Buf, 2, 80, 5000>::parallel_async_pso_seeded(&etor, 8, 500, &problem, seed)
      .unwrap()
      .get()
      .0
  });
  assert!(best < 100.0, "rosenbrock best {best}");
}

#[test]
fn rastrigin_converges() {
  let problem = functions::FUNCTIONS[4].problem();
  let best = best_of(5, |seed| {
    let etor = unpinned(4);
    Papso::<Buf, 8, 48, 5000>::parallel_async_pso_seeded(&etor, 4, 500, &problem, seed)
      .unwrap()
      .get()
      .0
  });
  assert!(best < 50.0, "rastrigin best {best}");
}

#[test]
fn ackley_converges() {
  let problem = functions::FUNCTIONS[5].problem();
  let best = best_of(3, |seed| {
    let etor = unpinned(4);
    Papso::<Buf, 16, 48, 5000>::parallel_async_pso_seeded(&etor, 4, 500, &problem, seed)
      .unwrap()
      .get()
      .0
  });
  assert!(best < 1.0, "ackley best {best}");
}

#[test]
fn griewank_converges() {
  let problem = functions::FUNCTIONS[6].problem();
  let best = best_of(3, |seed| {
    let etor = unpinned(4);
    Papso::<Buf, 2, 48, 5000>::parallel_async_pso_seeded(&etor, 4, 500, &problem, seed)
      .unwrap()
      .get()
      .0
  });
  assert!(best < 0.1, "griewank best {best}");
}

#[test]
fn single_threaded_configuration_degrades_gracefully() {
  // fork_count = 1, thread_count = 1: plain sequential PSO
  let problem = functions::FUNCTIONS[0].problem();
  let etor = unpinned(1);
  let (value, position) =
    Papso::<Buf, 2, 48, 1000>::parallel_async_pso_seeded(&etor, 1, 100, &problem, 3)
      .unwrap()
      .get();
  assert!(value < 1.0, "sphere best {value}");
  assert_eq!(position.len(), problem.dimension);
  for &x in &position {
    assert!((problem.bounds.0..=problem.bounds.1).contains(&x));
  }
}
