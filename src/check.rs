//! Heap consistency checking.

use crate::{
  block::{self, DSIZE, MIN_BLOCK_SIZE, Tag, WSIZE},
  config::FIXED_OVERHEAD,
  error::{HeapError, Problem},
  heap::Heap,
  source::MemorySource,
};

/// Totals gathered by [`Heap::check`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_size: usize,
  pub blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub largest_free: usize,
}

fn corrupt(
  offset: usize,
  problem: Problem,
) -> HeapError {
  HeapError::Corrupt { offset, problem }
}

impl<S: MemorySource> Heap<S> {
  /// Walks the heap and verifies every block invariant: matching tags,
  /// sizes, alignment, complete coalescing, the sentinels, the cursor and
  /// that the blocks account for every byte obtained from the source.
  pub fn check(&self) -> Result<HeapStats, HeapError> {
    let memory = self.source.memory();
    let brk = memory.len();

    if block::tag(memory, self.prologue) != Tag::allocated(DSIZE)
      || block::read_tag(memory, self.prologue) != Tag::allocated(DSIZE)
    {
      return Err(corrupt(self.prologue, Problem::BadPrologue));
    }

    let mut stats = HeapStats {
      heap_size: self.obtained,
      ..HeapStats::default()
    };
    let mut cursor_found = self.cursor == self.prologue;
    let mut prev_free = false;
    let mut bp = block::next(memory, self.prologue);

    loop {
      if bp > brk {
        return Err(corrupt(bp, Problem::OutOfBounds));
      }

      let header = block::tag(memory, bp);

      if header.size() == 0 {
        if !header.is_allocated() || bp != brk {
          return Err(corrupt(bp, Problem::BadEpilogue));
        }
        break;
      }

      if bp % DSIZE != 0 {
        return Err(corrupt(bp, Problem::Misaligned));
      }

      if header.size() < MIN_BLOCK_SIZE || header.size() % DSIZE != 0 {
        return Err(corrupt(bp, Problem::BadSize(header.size())));
      }

      // The block plus the next header must fit below the break.
      if bp + header.size() > brk {
        return Err(corrupt(bp, Problem::OutOfBounds));
      }

      let footer = block::read_tag(memory, block::footer(memory, bp));
      if header != footer {
        return Err(corrupt(
          bp,
          Problem::TagMismatch {
            header: header.bits(),
            footer: footer.bits(),
          },
        ));
      }

      if header.is_allocated() {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += header.size();
        prev_free = false;
      } else {
        if prev_free {
          return Err(corrupt(bp, Problem::AdjacentFree));
        }
        stats.free_blocks += 1;
        stats.free_bytes += header.size();
        stats.largest_free = stats.largest_free.max(header.size());
        prev_free = true;
      }

      stats.blocks += 1;
      cursor_found |= bp == self.cursor;
      bp += header.size();
    }

    if !cursor_found {
      return Err(corrupt(self.cursor, Problem::StrayCursor));
    }

    // The source may have been grown by someone else before the heap took
    // it over, so compare against what the heap itself obtained.
    let accounted = stats.free_bytes + stats.allocated_bytes + FIXED_OVERHEAD;
    if accounted != self.obtained {
      return Err(corrupt(
        brk - WSIZE,
        Problem::Unaccounted {
          accounted,
          heap: self.obtained,
        },
      ));
    }

    Ok(stats)
  }
}
