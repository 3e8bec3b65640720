use crate::{
  block::{DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
  error::HeapError,
};

/// Default heap growth increment (bytes).
pub const CHUNK_SIZE: usize = 1 << 12;

/// Default arena capacity (bytes).
pub const MAX_HEAP: usize = 20 * (1 << 20);

/// Bytes taken by the alignment pad, prologue and epilogue.
pub const FIXED_OVERHEAD: usize = 2 * DSIZE;

/// Largest heap whose data blocks can always be described by a tag, even
/// when every byte merges into one free block.
pub const MAX_HEAP_LIMIT: usize = MAX_BLOCK_SIZE.saturating_add(FIXED_OVERHEAD);

/// What `resize` does with the bytes a block no longer needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlackPolicy {
  /// Leave the block at its current size.
  #[default]
  Keep,
  /// Split the surplus off as a free block when it is large enough to
  /// stand alone.
  Reclaim,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  pub chunk_size: usize,
  pub max_heap: usize,
  pub slack: SlackPolicy,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      chunk_size: CHUNK_SIZE,
      max_heap: MAX_HEAP,
      slack: SlackPolicy::Keep,
    }
  }
}

impl HeapConfig {
  pub fn with_chunk_size(
    mut self,
    chunk_size: usize,
  ) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  pub fn with_max_heap(
    mut self,
    max_heap: usize,
  ) -> Self {
    self.max_heap = max_heap;
    self
  }

  pub fn with_slack(
    mut self,
    slack: SlackPolicy,
  ) -> Self {
    self.slack = slack;
    self
  }

  pub fn validate(&self) -> Result<(), HeapError> {
    if self.chunk_size < MIN_BLOCK_SIZE {
      return Err(HeapError::InvalidConfig("chunk size is smaller than a minimum block"));
    }

    if self.chunk_size % DSIZE != 0 {
      return Err(HeapError::InvalidConfig("chunk size must be a multiple of 8"));
    }

    if self.max_heap < FIXED_OVERHEAD + self.chunk_size {
      return Err(HeapError::InvalidConfig("max heap cannot hold the initial chunk"));
    }

    if self.max_heap > MAX_HEAP_LIMIT {
      return Err(HeapError::InvalidConfig("max heap exceeds what a block tag can describe"));
    }

    Ok(())
  }
}
