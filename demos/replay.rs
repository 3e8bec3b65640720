use std::{env, fs};

use anyhow::{Context, Result, bail};
use nextfit::{
  Heap, HeapConfig, SlackPolicy,
  trace::{Trace, replay},
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let mut args = env::args().skip(1);
  let Some(path) = args.next() else {
    bail!("usage: replay <trace-file> [--reclaim]");
  };
  let slack = if args.any(|arg| arg == "--reclaim") {
    SlackPolicy::Reclaim
  } else {
    SlackPolicy::Keep
  };

  let input = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
  let trace = Trace::parse(&input).with_context(|| format!("parsing {path}"))?;

  let mut heap = Heap::with_config(HeapConfig::default().with_slack(slack))?;
  let report = replay(&mut heap, &trace, true).with_context(|| format!("replaying {path}"))?;

  println!("{path}: {} ops", report.ops);
  println!("  peak payload : {} bytes", report.peak_payload);
  println!("  heap size    : {} bytes", report.heap_size);
  println!("  utilization  : {:.1}%", report.utilization() * 100.0);

  Ok(())
}
