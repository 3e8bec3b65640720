use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
  #[error("heap exhausted: could not grow by {requested} bytes")]
  OutOfMemory { requested: usize },

  #[error("request of {requested} bytes exceeds the largest block a tag can describe")]
  RequestTooLarge { requested: usize },

  #[error("program break moved outside the heap: expected {expected:#x}, found {found:#x}")]
  Discontiguous { expected: usize, found: usize },

  #[error("invalid heap configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("heap corrupt at offset {offset:#x}: {problem}")]
  Corrupt { offset: usize, problem: Problem },
}

/// What the heap checker found wrong with a block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Problem {
  #[error("prologue tags are not an allocated 8-byte pair")]
  BadPrologue,

  #[error("epilogue missing or not at the break")]
  BadEpilogue,

  #[error("header {header:#x} and footer {footer:#x} disagree")]
  TagMismatch { header: u32, footer: u32 },

  #[error("payload is not 8-byte aligned")]
  Misaligned,

  #[error("block size {0} is below the minimum or not a multiple of 8")]
  BadSize(usize),

  #[error("block runs past the break")]
  OutOfBounds,

  #[error("two adjacent free blocks escaped coalescing")]
  AdjacentFree,

  #[error("next-fit cursor does not point at a block")]
  StrayCursor,

  #[error("blocks account for {accounted} bytes but the heap holds {heap}")]
  Unaccounted { accounted: usize, heap: usize },
}
