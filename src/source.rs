//! Where heap bytes come from.
//!
//! The allocator only ever asks a source to move its break forward and
//! addresses everything as an offset from the source's base, so the same
//! heap logic runs over a private [`Arena`] or over the real process break
//! through [`ProgramBreak`].

use std::slice;

use crate::{align, block::DSIZE, error::HeapError};

/// The heap growth primitive.
pub trait MemorySource {
  /// Grows the region by `increment` bytes (a multiple of 8) and returns the
  /// previous break as an offset from [`MemorySource::base`].
  fn sbrk(
    &mut self,
    increment: usize,
  ) -> Result<usize, HeapError>;

  /// Current size of the region.
  fn brk(&self) -> usize;

  fn memory(&self) -> &[u8];

  fn memory_mut(&mut self) -> &mut [u8];

  /// Address of offset zero.
  fn base(&self) -> *const u8;
}

/// A fixed-capacity region reserved up front, handed out by moving a break
/// offset. Its base is 8-byte aligned.
pub struct Arena {
  words: Box<[u64]>,
  brk: usize,
}

impl Arena {
  pub fn new(capacity: usize) -> Self {
    Self {
      words: vec![0u64; align!(capacity) / DSIZE].into_boxed_slice(),
      brk: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.words.len() * DSIZE
  }
}

impl MemorySource for Arena {
  fn sbrk(
    &mut self,
    increment: usize,
  ) -> Result<usize, HeapError> {
    let old = self.brk;

    match old.checked_add(increment) {
      Some(new) if new <= self.capacity() => {
        self.brk = new;
        Ok(old)
      }
      _ => Err(HeapError::OutOfMemory { requested: increment }),
    }
  }

  fn brk(&self) -> usize {
    self.brk
  }

  fn memory(&self) -> &[u8] {
    // SAFETY: `brk` never exceeds the byte length of `words`, and any bit
    // pattern of a `u64` is a valid sequence of bytes.
    unsafe { slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.brk) }
  }

  fn memory_mut(&mut self) -> &mut [u8] {
    // SAFETY: as in `memory`, and the slice borrows `self` mutably.
    unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.brk) }
  }

  fn base(&self) -> *const u8 {
    self.words.as_ptr().cast()
  }
}

#[cfg(unix)]
pub use program_break::ProgramBreak;

#[cfg(unix)]
mod program_break {
  use std::slice;

  use libc::{c_void, intptr_t, sbrk};
  use tracing::{debug, warn};

  use crate::{align, config::MAX_HEAP_LIMIT, error::HeapError};

  use super::MemorySource;

  fn failed(address: *mut c_void) -> bool {
    address == usize::MAX as *mut c_void
  }

  /// The process data segment, grown with `sbrk(2)`.
  ///
  /// The region starts at the break observed on construction (rounded up to
  /// 8 bytes) and must stay contiguous: if anything else in the process
  /// moves the break in between, the next extension fails with
  /// [`HeapError::Discontiguous`] instead of handing out foreign memory.
  pub struct ProgramBreak {
    base: *mut u8,
    brk: usize,
    limit: usize,
  }

  impl ProgramBreak {
    /// Claims the current program break. At most `limit` bytes will ever be
    /// requested from the kernel.
    pub fn new(limit: usize) -> Result<Self, HeapError> {
      if limit > MAX_HEAP_LIMIT {
        return Err(HeapError::InvalidConfig("break limit exceeds what a block tag can describe"));
      }

      let current = unsafe { sbrk(0) };

      if failed(current) {
        return Err(HeapError::OutOfMemory { requested: 0 });
      }

      let address = current as usize;
      let pad = align!(address) - address;

      if pad > 0 {
        let previous = unsafe { sbrk(pad as intptr_t) };

        if failed(previous) {
          return Err(HeapError::OutOfMemory { requested: pad });
        }

        if previous != current {
          return Err(HeapError::Discontiguous {
            expected: address,
            found: previous as usize,
          });
        }
      }

      debug!(base = address + pad, limit, "claimed program break");

      Ok(Self {
        base: (address + pad) as *mut u8,
        brk: 0,
        limit,
      })
    }
  }

  impl MemorySource for ProgramBreak {
    fn sbrk(
      &mut self,
      increment: usize,
    ) -> Result<usize, HeapError> {
      if increment > self.limit - self.brk || increment > intptr_t::MAX as usize {
        return Err(HeapError::OutOfMemory { requested: increment });
      }

      let expected = self.base as usize + self.brk;
      let previous = unsafe { sbrk(increment as intptr_t) };

      if failed(previous) {
        warn!(increment, "sbrk refused to grow the heap");
        return Err(HeapError::OutOfMemory { requested: increment });
      }

      if previous as usize != expected {
        // Hand the foreign extension back before reporting.
        unsafe { sbrk(-(increment as intptr_t)) };

        return Err(HeapError::Discontiguous {
          expected,
          found: previous as usize,
        });
      }

      let old = self.brk;
      self.brk += increment;
      Ok(old)
    }

    fn brk(&self) -> usize {
      self.brk
    }

    fn memory(&self) -> &[u8] {
      // SAFETY: [base, base + brk) was obtained from sbrk and is owned by
      // this value until it is dropped.
      unsafe { slice::from_raw_parts(self.base, self.brk) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
      // SAFETY: as in `memory`, borrowed mutably through `self`.
      unsafe { slice::from_raw_parts_mut(self.base, self.brk) }
    }

    fn base(&self) -> *const u8 {
      self.base
    }
  }

  impl Drop for ProgramBreak {
    fn drop(&mut self) {
      unsafe {
        // Only shrink when our region is still the top of the data segment.
        if self.brk > 0 && sbrk(0) as usize == self.base as usize + self.brk {
          sbrk(-(self.brk as intptr_t));
        }
      }
    }
  }
}
