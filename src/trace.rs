//! Allocator-lab trace files and a checked replayer.
//!
//! A trace starts with four header numbers (suggested heap size, number of
//! ids, number of ops, weight) followed by one op per line:
//!
//! ```text
//!   20000
//!   2
//!   4
//!   1
//!   a 0 512
//!   a 1 128
//!   r 0 640
//!   f 1
//! ```

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::{
  block::DSIZE,
  error::HeapError,
  heap::{Heap, HeapPtr},
  source::MemorySource,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
  Alloc { id: usize, size: usize },
  Realloc { id: usize, size: usize },
  Free { id: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
  pub suggested_heap: usize,
  pub ids: usize,
  pub weight: usize,
  pub ops: Vec<Op>,
}

#[derive(Debug, Error)]
pub enum TraceError {
  #[error("line {line}: {reason}")]
  Parse { line: usize, reason: String },

  #[error("op {index}: {source}")]
  Heap { index: usize, source: HeapError },

  #[error("op {index}: {violation}")]
  Invalid { index: usize, violation: Violation },
}

/// A broken allocator guarantee, or an op that makes no sense for the
/// trace's ids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("id {0} is out of range")]
  UnknownId(usize),

  #[error("id {0} is not allocated")]
  NotLive(usize),

  #[error("id {0} is already allocated")]
  AlreadyLive(usize),

  #[error("payload of id {0} is not 8-byte aligned")]
  Misaligned(usize),

  #[error("payload of id {0} is smaller than requested or lies outside the heap")]
  OutOfHeap(usize),

  #[error("payload of id {id} overlaps id {other}")]
  Overlap { id: usize, other: usize },

  #[error("payload of id {0} was overwritten while allocated")]
  Clobbered(usize),
}

fn parse_error(
  line: usize,
  reason: impl Into<String>,
) -> TraceError {
  TraceError::Parse {
    line,
    reason: reason.into(),
  }
}

fn number(
  line: usize,
  field: Option<&str>,
  what: &str,
) -> Result<usize, TraceError> {
  let field = field.ok_or_else(|| parse_error(line, format!("missing {what}")))?;
  field
    .parse()
    .map_err(|_| parse_error(line, format!("invalid {what} `{field}`")))
}

impl Trace {
  pub fn parse(input: &str) -> Result<Self, TraceError> {
    let mut lines = input
      .lines()
      .enumerate()
      .map(|(i, line)| (i + 1, line.trim()))
      .filter(|(_, line)| !line.is_empty());

    let mut header = [0usize; 4];
    for (slot, what) in header
      .iter_mut()
      .zip(["heap size", "id count", "op count", "weight"])
    {
      let (line, text) = lines
        .next()
        .ok_or_else(|| parse_error(0, format!("missing {what}")))?;
      *slot = number(line, Some(text), what)?;
    }
    let [suggested_heap, ids, op_count, weight] = header;

    // The header is untrusted; let the ops themselves size the vector.
    let mut ops = Vec::new();
    let mut last_line = 0;

    for (line, text) in lines {
      let mut fields = text.split_whitespace();
      let kind = fields.next().unwrap_or_default();
      let id = number(line, fields.next(), "id")?;

      if id >= ids {
        return Err(parse_error(line, format!("id {id} exceeds the declared {ids}")));
      }

      let op = match kind {
        "a" => Op::Alloc {
          id,
          size: number(line, fields.next(), "size")?,
        },
        "r" => Op::Realloc {
          id,
          size: number(line, fields.next(), "size")?,
        },
        "f" => Op::Free { id },
        other => return Err(parse_error(line, format!("unknown op `{other}`"))),
      };

      if fields.next().is_some() {
        return Err(parse_error(line, "trailing fields"));
      }

      ops.push(op);
      last_line = line;
    }

    if ops.len() != op_count {
      return Err(parse_error(
        last_line,
        format!("expected {op_count} ops, found {}", ops.len()),
      ));
    }

    Ok(Self {
      suggested_heap,
      ids,
      weight,
      ops,
    })
  }
}

impl FromStr for Trace {
  type Err = TraceError;

  fn from_str(input: &str) -> Result<Self, Self::Err> {
    Self::parse(input)
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplayReport {
  pub ops: usize,
  /// Largest sum of live requested sizes at any point.
  pub peak_payload: usize,
  pub heap_size: usize,
}

impl ReplayReport {
  /// Peak live payload over heap size.
  pub fn utilization(&self) -> f64 {
    if self.heap_size == 0 {
      return 0.0;
    }
    self.peak_payload as f64 / self.heap_size as f64
  }
}

fn pattern(
  id: usize,
  index: usize,
) -> u8 {
  (id.wrapping_mul(131).wrapping_add(index) & 0xff) as u8
}

struct Replayer<'h, S: MemorySource> {
  heap: &'h mut Heap<S>,
  live: Vec<Option<(HeapPtr, usize)>>,
  index: usize,
}

impl<S: MemorySource> Replayer<'_, S> {
  fn invalid(
    &self,
    violation: Violation,
  ) -> TraceError {
    TraceError::Invalid {
      index: self.index,
      violation,
    }
  }

  fn heap_error(
    &self,
    source: HeapError,
  ) -> TraceError {
    TraceError::Heap {
      index: self.index,
      source,
    }
  }

  fn take(
    &mut self,
    id: usize,
  ) -> Result<(HeapPtr, usize), TraceError> {
    let (ptr, size) = self.live[id].take().ok_or_else(|| self.invalid(Violation::NotLive(id)))?;
    self.verify_pattern(id, ptr, size)?;
    Ok((ptr, size))
  }

  fn verify_pattern(
    &self,
    id: usize,
    ptr: HeapPtr,
    len: usize,
  ) -> Result<(), TraceError> {
    let intact = self.heap.payload(ptr)[..len]
      .iter()
      .enumerate()
      .all(|(i, &byte)| byte == pattern(id, i));

    if intact { Ok(()) } else { Err(self.invalid(Violation::Clobbered(id))) }
  }

  /// Checks a freshly returned payload against every live one, then fills it.
  fn install(
    &mut self,
    id: usize,
    ptr: HeapPtr,
    size: usize,
  ) -> Result<(), TraceError> {
    if ptr.offset() % DSIZE != 0 || self.heap.as_ptr(ptr) as usize % DSIZE != 0 {
      return Err(self.invalid(Violation::Misaligned(id)));
    }

    let start = ptr.offset();
    let end = start + size;

    if self.heap.capacity(ptr) < size || end > self.heap.source().brk() {
      return Err(self.invalid(Violation::OutOfHeap(id)));
    }

    let overlap = self.live.iter().enumerate().find_map(|(other, slot)| {
      let (p, s) = (*slot)?;
      (start < p.offset() + s && p.offset() < end).then_some(other)
    });

    if let Some(other) = overlap {
      return Err(self.invalid(Violation::Overlap { id, other }));
    }

    for (i, byte) in self.heap.payload_mut(ptr)[..size].iter_mut().enumerate() {
      *byte = pattern(id, i);
    }

    self.live[id] = Some((ptr, size));
    Ok(())
  }
}

/// Runs `trace` against `heap`, checking every returned payload and, with
/// `check_heap`, the full heap after each op.
pub fn replay<S: MemorySource>(
  heap: &mut Heap<S>,
  trace: &Trace,
  check_heap: bool,
) -> Result<ReplayReport, TraceError> {
  // Slots only for ids the ops use, whatever the header declares.
  let used_ids = trace
    .ops
    .iter()
    .map(|op| match *op {
      Op::Alloc { id, .. } | Op::Realloc { id, .. } | Op::Free { id } => id.saturating_add(1),
    })
    .max()
    .unwrap_or(0)
    .min(trace.ids);

  let mut replayer = Replayer {
    heap,
    live: vec![None; used_ids],
    index: 0,
  };
  let mut payload = 0usize;
  let mut peak_payload = 0usize;

  for (index, op) in trace.ops.iter().enumerate() {
    replayer.index = index;

    match *op {
      Op::Alloc { id, size } => {
        if id >= replayer.live.len() {
          return Err(replayer.invalid(Violation::UnknownId(id)));
        }
        if replayer.live[id].is_some() {
          return Err(replayer.invalid(Violation::AlreadyLive(id)));
        }

        let allocated = replayer
          .heap
          .allocate(size)
          .map_err(|err| replayer.heap_error(err))?;

        if let Some(ptr) = allocated {
          replayer.install(id, ptr, size)?;
          payload += size;
        }
      }
      Op::Realloc { id, size } => {
        if id >= replayer.live.len() {
          return Err(replayer.invalid(Violation::UnknownId(id)));
        }

        let (old, old_size) = replayer.take(id)?;

        let resized = replayer.heap.resize(old, size);
        let resized = match resized {
          Ok(resized) => resized,
          Err(err) => {
            replayer.live[id] = Some((old, old_size));
            return Err(replayer.heap_error(err));
          }
        };

        payload -= old_size;
        if let Some(ptr) = resized {
          replayer.verify_pattern(id, ptr, old_size.min(size))?;
          replayer.install(id, ptr, size)?;
          payload += size;
        }
      }
      Op::Free { id } => {
        if id >= replayer.live.len() {
          return Err(replayer.invalid(Violation::UnknownId(id)));
        }

        let (ptr, size) = replayer.take(id)?;
        replayer.heap.release(ptr);
        payload -= size;
      }
    }

    peak_payload = peak_payload.max(payload);

    if check_heap {
      replayer
        .heap
        .check()
        .map_err(|err| replayer.heap_error(err))?;
    }
  }

  let report = ReplayReport {
    ops: trace.ops.len(),
    peak_payload,
    heap_size: replayer.heap.heap_size(),
  };

  debug!(
    ops = report.ops,
    peak = report.peak_payload,
    heap = report.heap_size,
    "trace replayed"
  );

  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::HeapConfig;

  const SAMPLE: &str = "20000\n2\n4\n1\na 0 512\na 1 128\nr 0 640\nf 1\n";

  fn heap() -> Heap {
    Heap::with_config(HeapConfig::default().with_max_heap(1 << 20)).unwrap()
  }

  #[test]
  fn test_parse_sample() {
    let trace: Trace = SAMPLE.parse().unwrap();

    assert_eq!(trace.suggested_heap, 20000);
    assert_eq!(trace.ids, 2);
    assert_eq!(trace.weight, 1);
    assert_eq!(
      trace.ops,
      vec![
        Op::Alloc { id: 0, size: 512 },
        Op::Alloc { id: 1, size: 128 },
        Op::Realloc { id: 0, size: 640 },
        Op::Free { id: 1 },
      ]
    );
  }

  #[test]
  fn test_parse_errors_carry_line_numbers() {
    let err = Trace::parse("100\n1\n1\n1\nx 0 5\n").unwrap_err();
    assert!(matches!(err, TraceError::Parse { line: 5, .. }));

    let err = Trace::parse("100\n1\n1\n1\na 3 5\n").unwrap_err();
    assert!(matches!(err, TraceError::Parse { line: 5, .. }));

    let err = Trace::parse("100\n1\n2\n1\n\na 0 5\n").unwrap_err();
    assert!(matches!(err, TraceError::Parse { line: 6, .. }));

    let err = Trace::parse("100\nmany\n").unwrap_err();
    assert_eq!(err.to_string(), "line 2: invalid id count `many`");
  }

  #[test]
  fn test_parse_oversized_header() {
    let err = Trace::parse("100\n1\n18446744073709551615\n1\na 0 5\n").unwrap_err();
    assert!(matches!(err, TraceError::Parse { line: 5, .. }));
  }

  #[test]
  fn test_replay_ignores_declared_id_count() {
    let mut heap = heap();
    let trace = Trace {
      suggested_heap: 0,
      ids: usize::MAX,
      weight: 1,
      ops: vec![Op::Alloc { id: 3, size: 8 }, Op::Free { id: 3 }],
    };

    let report = replay(&mut heap, &trace, true).unwrap();
    assert_eq!(report.peak_payload, 8);

    let trace = Trace {
      ids: 2,
      ..trace
    };
    let err = replay(&mut heap, &trace, false).unwrap_err();
    assert!(matches!(
      err,
      TraceError::Invalid {
        index: 0,
        violation: Violation::UnknownId(3),
      }
    ));
  }

  #[test]
  fn test_replay_sample() {
    let mut heap = heap();
    let trace = Trace::parse(SAMPLE).unwrap();

    let report = replay(&mut heap, &trace, true).unwrap();

    assert_eq!(report.ops, 4);
    assert_eq!(report.peak_payload, 768);
    assert_eq!(report.heap_size, heap.heap_size());
    assert!(report.utilization() > 0.0 && report.utilization() < 1.0);
  }

  #[test]
  fn test_replay_rejects_double_free() {
    let mut heap = heap();
    let trace = Trace::parse("100\n1\n3\n1\na 0 8\nf 0\nf 0\n").unwrap();

    let err = replay(&mut heap, &trace, false).unwrap_err();
    assert!(matches!(
      err,
      TraceError::Invalid {
        index: 2,
        violation: Violation::NotLive(0),
      }
    ));
  }

  #[test]
  fn test_replay_reports_exhaustion() {
    let mut heap = Heap::with_config(HeapConfig::default().with_max_heap(8192)).unwrap();
    let trace = Trace::parse("100\n2\n2\n1\na 0 1000\na 1 100000\n").unwrap();

    let err = replay(&mut heap, &trace, true).unwrap_err();
    assert!(matches!(
      err,
      TraceError::Heap {
        index: 1,
        source: HeapError::OutOfMemory { .. },
      }
    ));
    heap.check().unwrap();
  }
}
