use std::process;

use clap::Parser;
use log::info;

use papso::functions;
use papso::{DefaultPapso, Executor, ExecutorOptions};

/// parallel asynchronous particle swarm optimizer
#[derive(Parser)]
#[command(version)]
struct Args {
  /// number of subswarms
  fork_count: usize,

  /// iterations per task
  iter_per_task: usize,

  /// worker threads, defaults to the fork count
  thread_count: Option<usize>,
}

fn main() {
  env_logger::init();

  let args = Args::try_parse().unwrap_or_else(|err| {
    eprintln!("{err}");
    process::exit(-1);
  });

  let thread_count = args.thread_count.unwrap_or(args.fork_count).max(1);
  let etor = Executor::with_options(ExecutorOptions {
    parallelism: thread_count,
    ..ExecutorOptions::default()
  });

  // same benchmark problem as the original suite
  let rosenbrock = &functions::FUNCTIONS[2];
  let problem = rosenbrock.problem();
  info!(
    "optimizing {} with {} forks, {} iterations/task on {} threads",
    rosenbrock.name, args.fork_count, args.iter_per_task, thread_count
  );

  let handle =
    DefaultPapso::parallel_async_pso(&etor, args.fork_count, args.iter_per_task, &problem)
      .unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(-1);
      });

  let (best_value, _best_position) = handle.get();
  println!("par async pso @{}: {}", rosenbrock.name, best_value);

  etor.done();
}
