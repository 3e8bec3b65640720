//! Boundary-tag layout.
//!
//! A block is addressed by the offset of its payload (`bp`). The header
//! word sits just before the payload and the footer word closes the block:
//!
//! ```text
//!   bp - WSIZE        bp                          bp + size - DSIZE
//!   ┌──────────┬──────────────────────────────┬──────────┐
//!   │  header  │           payload            │  footer  │
//!   │  size|a  │                              │  size|a  │
//!   └──────────┴──────────────────────────────┴──────────┘
//!   ◄──────────────────────── size ──────────────────────►
//! ```

/// Header/footer word size in bytes.
pub const WSIZE: usize = 4;

/// Double word: the alignment unit and the combined tag overhead.
pub const DSIZE: usize = 8;

/// Smallest block worth creating: both tags plus one aligned payload word.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Largest size a tag can carry.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(DSIZE - 1);

const ALLOCATED: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

/// A packed boundary tag: block size in the high bits, allocated flag in
/// bit 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
  /// Marks the end of the heap.
  pub const EPILOGUE: Tag = Tag::new(0, true);

  /// Packs `size` and `allocated`. `size` must be a multiple of 8 no larger
  /// than [`MAX_BLOCK_SIZE`].
  pub const fn new(
    size: usize,
    allocated: bool,
  ) -> Self {
    debug_assert!(size <= MAX_BLOCK_SIZE && size % DSIZE == 0);
    Self(size as u32 | if allocated { ALLOCATED } else { 0 })
  }

  pub const fn free(size: usize) -> Self {
    Self::new(size, false)
  }

  pub const fn allocated(size: usize) -> Self {
    Self::new(size, true)
  }

  pub const fn from_bits(bits: u32) -> Self {
    Self(bits)
  }

  pub const fn bits(self) -> u32 {
    self.0
  }

  pub const fn size(self) -> usize {
    (self.0 & SIZE_MASK) as usize
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOCATED != 0
  }
}

pub fn read_tag(
  memory: &[u8],
  at: usize,
) -> Tag {
  let mut word = [0u8; WSIZE];
  word.copy_from_slice(&memory[at..at + WSIZE]);
  Tag(u32::from_ne_bytes(word))
}

pub fn write_tag(
  memory: &mut [u8],
  at: usize,
  tag: Tag,
) {
  memory[at..at + WSIZE].copy_from_slice(&tag.0.to_ne_bytes());
}

/// Offset of the header of block `bp`.
pub const fn header(bp: usize) -> usize {
  bp - WSIZE
}

/// Offset of the footer of block `bp`, derived from its header.
pub fn footer(
  memory: &[u8],
  bp: usize,
) -> usize {
  bp + size(memory, bp) - DSIZE
}

pub fn tag(
  memory: &[u8],
  bp: usize,
) -> Tag {
  read_tag(memory, header(bp))
}

pub fn size(
  memory: &[u8],
  bp: usize,
) -> usize {
  tag(memory, bp).size()
}

pub fn is_allocated(
  memory: &[u8],
  bp: usize,
) -> bool {
  tag(memory, bp).is_allocated()
}

/// Payload offset of the block following `bp`.
pub fn next(
  memory: &[u8],
  bp: usize,
) -> usize {
  bp + size(memory, bp)
}

/// Payload offset of the block preceding `bp`, found through its footer.
pub fn prev(
  memory: &[u8],
  bp: usize,
) -> usize {
  bp - read_tag(memory, bp - DSIZE).size()
}

/// Writes `tag` to both the header and the footer of block `bp`. The footer
/// position follows the size carried by `tag`, not the old header.
pub fn set(
  memory: &mut [u8],
  bp: usize,
  tag: Tag,
) {
  write_tag(memory, header(bp), tag);
  write_tag(memory, bp + tag.size() - DSIZE, tag);
}
