//! # nextfit - A Boundary-Tag Heap Allocator
//!
//! This crate provides an **implicit free-list allocator** with boundary-tag
//! coalescing and a **next-fit** placement policy, running over a single
//! contiguous region that only ever grows at its high end.
//!
//! ## Overview
//!
//! Every block carries its size and allocated bit twice, in a header word
//! before the payload and a footer word after it. Free blocks are found by
//! walking the blocks themselves; no separate list is kept.
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌─────┬──────────┬──────────────┬──────────┬──────────────┬──────────┐
//!   │ pad │ prologue │   block A    │ block B  │   block C    │ epilogue │
//!   │     │   8/1    │ 112/1 (used) │ 48/0     │ 3936/1       │   0/1    │
//!   └─────┴──────────┴──────────────┴──────────┴──────────────┴──────────┘
//!                                       ▲                                ▲
//!                                       │                                │
//!                                 Next-fit cursor                   Break (brk)
//!
//!   The prologue and epilogue are permanently allocated sentinels, so a
//!   walk in either direction always stops inside the heap.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   nextfit
//!   ├── align      - Alignment macro (align!)
//!   ├── block      - Boundary tags and block arithmetic
//!   ├── check      - Heap consistency checker
//!   ├── config     - HeapConfig and SlackPolicy
//!   ├── error      - HeapError
//!   ├── heap       - Heap: allocate, release, resize
//!   ├── source     - MemorySource, Arena, ProgramBreak
//!   └── trace      - Allocator-lab trace parsing and replay
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use nextfit::{Heap, HeapConfig};
//!
//! let mut heap = Heap::with_config(HeapConfig::default()).unwrap();
//!
//! // Allocate 100 bytes
//! let ptr = heap.allocate(100).unwrap().unwrap();
//!
//! // Use the memory
//! heap.payload_mut(ptr)[..5].copy_from_slice(b"hello");
//!
//! // Grow it; the free space after it is absorbed in place
//! let ptr = heap.resize(ptr, 400).unwrap().unwrap();
//! assert_eq!(&heap.payload(ptr)[..5], b"hello");
//!
//! // Free the memory
//! heap.release(ptr);
//! heap.check().unwrap();
//! ```
//!
//! ## How It Works
//!
//! ```text
//!   allocate(n)
//!     │
//!     ├── n == 0 ──────────────────────────────► None
//!     │
//!     ├── next-fit search from the cursor ──┬─► found: place (split if the
//!     │                                     │   remainder is >= 16 bytes)
//!     │                                     │
//!     │                                     └─► missing: extend the heap by
//!     │                                         max(block, chunk), coalesce
//!     │                                         with a free tail, place
//!     │
//!   release(p) ── mark free ── coalesce with free neighbours
//!
//!   resize(p, n) ── fits? keep ── free successor big enough? absorb it
//!                                  └── otherwise allocate, copy, release
//! ```
//!
//! Blocks are addressed by payload offsets ([`HeapPtr`]) from the base of a
//! [`MemorySource`], so the same heap runs over a private [`Arena`] or the
//! process data segment through [`ProgramBreak`] (`sbrk(2)`).
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization primitives
//! - **Never shrinks**: memory is not returned to the source while the heap
//!   lives
//! - **No misuse detection**: releasing a foreign or already free pointer is
//!   the caller's bug

pub mod align;
pub mod block;
mod check;
mod config;
mod error;
mod heap;
mod source;
pub mod trace;

pub use check::HeapStats;
pub use config::{CHUNK_SIZE, FIXED_OVERHEAD, HeapConfig, MAX_HEAP, MAX_HEAP_LIMIT, SlackPolicy};
pub use error::{HeapError, Problem};
pub use heap::{BlockInfo, Heap, HeapPtr};
#[cfg(unix)]
pub use source::ProgramBreak;
pub use source::{Arena, MemorySource};
