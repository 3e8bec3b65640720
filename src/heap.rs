use tracing::{debug, trace, warn};

use crate::{
  align,
  block::{self, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Tag, WSIZE},
  config::{FIXED_OVERHEAD, HeapConfig, SlackPolicy},
  error::HeapError,
  source::{Arena, MemorySource},
};

/// A payload handed out by [`Heap::allocate`]: the offset of the first
/// payload byte from the source's base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapPtr(pub(crate) usize);

impl HeapPtr {
  pub fn offset(self) -> usize {
    self.0
  }
}

/// One data block as seen by a heap walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  pub ptr: HeapPtr,
  pub size: usize,
  pub allocated: bool,
}

/// An implicit free-list heap with boundary-tag coalescing and next-fit
/// placement.
pub struct Heap<S: MemorySource = Arena> {
  pub(crate) source: S,
  pub(crate) config: HeapConfig,
  /// Payload offset of the prologue block.
  pub(crate) prologue: usize,
  /// Where the last search stopped.
  pub(crate) cursor: usize,
  /// Bytes this heap has taken from the source.
  pub(crate) obtained: usize,
}

/// Block size needed to hold `size` payload bytes.
fn adjusted_size(size: usize) -> Result<usize, HeapError> {
  if size <= DSIZE {
    return Ok(MIN_BLOCK_SIZE);
  }

  match size.checked_add(DSIZE) {
    Some(total) if total <= MAX_BLOCK_SIZE => Ok(align!(total)),
    _ => Err(HeapError::RequestTooLarge { requested: size }),
  }
}

/// Whether `data` bytes of blocks can grow by `increment` while the sum, the
/// largest block coalescing could ever build, still fits a tag.
fn tag_can_span(
  data: usize,
  increment: usize,
) -> bool {
  data.checked_add(increment).is_some_and(|total| total <= MAX_BLOCK_SIZE)
}

impl Heap<Arena> {
  /// Builds a heap over a fresh [`Arena`] of `config.max_heap` bytes.
  pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
    Self::new(Arena::new(config.max_heap), config)
  }
}

impl<S: MemorySource> Heap<S> {
  /// Lays out the padding word, prologue and epilogue at the source's break
  /// and seeds the heap with one free chunk.
  pub fn new(
    source: S,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    config.validate()?;

    let mut heap = Self {
      source,
      config,
      prologue: 0,
      cursor: 0,
      obtained: 0,
    };

    let start = heap.source.sbrk(4 * WSIZE)?;
    heap.obtained = 4 * WSIZE;
    let memory = heap.source.memory_mut();

    memory[start..start + WSIZE].fill(0);
    block::write_tag(memory, start + WSIZE, Tag::allocated(DSIZE));
    block::write_tag(memory, start + 2 * WSIZE, Tag::allocated(DSIZE));
    block::write_tag(memory, start + 3 * WSIZE, Tag::EPILOGUE);

    heap.prologue = start + DSIZE;
    heap.cursor = heap.prologue;

    heap.extend(config.chunk_size / WSIZE)?;
    heap.cursor = heap.prologue;

    debug!(chunk = config.chunk_size, brk = heap.source.brk(), "heap initialized");

    Ok(heap)
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Bytes obtained from the source so far.
  pub fn heap_size(&self) -> usize {
    self.obtained
  }

  /// The block the next search resumes after.
  pub fn cursor(&self) -> HeapPtr {
    HeapPtr(self.cursor)
  }

  /// Usable payload bytes of an allocated block, which may exceed what was
  /// requested.
  pub fn capacity(
    &self,
    ptr: HeapPtr,
  ) -> usize {
    block::size(self.source.memory(), ptr.0) - DSIZE
  }

  pub fn payload(
    &self,
    ptr: HeapPtr,
  ) -> &[u8] {
    let capacity = self.capacity(ptr);
    &self.source.memory()[ptr.0..ptr.0 + capacity]
  }

  pub fn payload_mut(
    &mut self,
    ptr: HeapPtr,
  ) -> &mut [u8] {
    let capacity = self.capacity(ptr);
    &mut self.source.memory_mut()[ptr.0..ptr.0 + capacity]
  }

  /// Machine address of a payload. Valid until the heap is dropped.
  pub fn as_ptr(
    &self,
    ptr: HeapPtr,
  ) -> *const u8 {
    self.source.base().wrapping_add(ptr.0)
  }

  /// Walks every data block between the prologue and the epilogue.
  pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    let memory = self.source.memory();
    let mut bp = block::next(memory, self.prologue);

    std::iter::from_fn(move || {
      let tag = block::tag(memory, bp);

      if tag.size() == 0 {
        return None;
      }

      let info = BlockInfo {
        ptr: HeapPtr(bp),
        size: tag.size(),
        allocated: tag.is_allocated(),
      };
      bp += tag.size();
      Some(info)
    })
  }

  /// Returns a block with at least `size` payload bytes, `Ok(None)` for a
  /// zero-size request.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Option<HeapPtr>, HeapError> {
    if size == 0 {
      return Ok(None);
    }

    let asize = adjusted_size(size)?;
    let bp = self.allocate_block(asize).inspect_err(|err| {
      warn!(size, %err, "allocation failed");
    })?;

    trace!(size, asize, offset = bp, "allocate");
    Ok(Some(HeapPtr(bp)))
  }

  fn allocate_block(
    &mut self,
    asize: usize,
  ) -> Result<usize, HeapError> {
    let bp = match self.find_fit(asize) {
      Some(bp) => bp,
      None => self.extend(asize.max(self.config.chunk_size) / WSIZE)?,
    };

    self.place(bp, asize);
    self.cursor = bp;
    Ok(bp)
  }

  /// Returns a block to the heap.
  ///
  /// `ptr` must come from this heap and still be allocated; neither is
  /// checked.
  pub fn release(
    &mut self,
    ptr: HeapPtr,
  ) {
    let memory = self.source.memory_mut();
    let size = block::size(memory, ptr.0);

    block::set(memory, ptr.0, Tag::free(size));
    self.coalesce(ptr.0);

    trace!(offset = ptr.0, size, "release");
  }

  /// Changes the payload size of `ptr`, in place when the block or its free
  /// successor can hold `size` bytes, otherwise by moving it. A zero `size`
  /// releases the block and returns `Ok(None)`.
  ///
  /// On error the block at `ptr` is left allocated and unchanged.
  pub fn resize(
    &mut self,
    ptr: HeapPtr,
    size: usize,
  ) -> Result<Option<HeapPtr>, HeapError> {
    if size == 0 {
      self.release(ptr);
      return Ok(None);
    }

    let bp = ptr.0;
    let asize = adjusted_size(size)?;
    let old_size = block::size(self.source.memory(), bp);

    if asize <= old_size {
      self.trim(bp, asize);
      trace!(offset = bp, size, "resize kept in place");
      return Ok(Some(ptr));
    }

    let memory = self.source.memory();
    let next = block::next(memory, bp);
    let next_tag = block::tag(memory, next);

    if !next_tag.is_allocated() && old_size + next_tag.size() >= asize {
      if self.cursor == next {
        self.cursor = bp;
      }

      block::set(
        self.source.memory_mut(),
        bp,
        Tag::allocated(old_size + next_tag.size()),
      );
      self.trim(bp, asize);

      trace!(offset = bp, size, absorbed = next_tag.size(), "resize grew in place");
      return Ok(Some(ptr));
    }

    let moved = self.allocate_block(asize).inspect_err(|err| {
      warn!(size, %err, "resize failed");
    })?;

    let copied = (old_size - DSIZE).min(size);
    self.source.memory_mut().copy_within(bp..bp + copied, moved);
    self.release(ptr);

    trace!(from = bp, to = moved, copied, "resize moved");
    Ok(Some(HeapPtr(moved)))
  }

  /// Next-fit search: forward from the block after the cursor to the
  /// epilogue, then from the first block round to the cursor.
  fn find_fit(
    &self,
    asize: usize,
  ) -> Option<usize> {
    let memory = self.source.memory();
    let fits = |bp: usize| {
      let tag = block::tag(memory, bp);
      !tag.is_allocated() && asize <= tag.size()
    };

    let mut bp = block::next(memory, self.cursor);
    while block::size(memory, bp) != 0 {
      if fits(bp) {
        return Some(bp);
      }
      bp = block::next(memory, bp);
    }

    let mut bp = self.prologue;
    while bp < self.cursor {
      bp = block::next(memory, bp);
      if fits(bp) {
        return Some(bp);
      }
    }

    None
  }

  /// Allocates `asize` bytes at the start of free block `bp`, splitting off
  /// the remainder when it can stand as a block of its own.
  fn place(
    &mut self,
    bp: usize,
    asize: usize,
  ) {
    let memory = self.source.memory_mut();
    let csize = block::size(memory, bp);

    if csize - asize >= MIN_BLOCK_SIZE {
      block::set(memory, bp, Tag::allocated(asize));
      let rest = block::next(memory, bp);
      block::set(memory, rest, Tag::free(csize - asize));
    } else {
      block::set(memory, bp, Tag::allocated(csize));
    }
  }

  /// Under [`SlackPolicy::Reclaim`], frees whatever allocated block `bp`
  /// holds beyond `asize`.
  fn trim(
    &mut self,
    bp: usize,
    asize: usize,
  ) {
    if self.config.slack == SlackPolicy::Keep {
      return;
    }

    let memory = self.source.memory_mut();
    let csize = block::size(memory, bp);

    if csize - asize < MIN_BLOCK_SIZE {
      return;
    }

    block::set(memory, bp, Tag::allocated(asize));
    let rest = block::next(memory, bp);
    block::set(memory, rest, Tag::free(csize - asize));
    self.coalesce(rest);
  }

  /// Grows the heap by `words` (rounded up to even) and returns the new free
  /// block, merged with a free block that ended at the old break.
  fn extend(
    &mut self,
    words: usize,
  ) -> Result<usize, HeapError> {
    let size = if words % 2 == 1 { (words + 1) * WSIZE } else { words * WSIZE };

    if !tag_can_span(self.obtained - FIXED_OVERHEAD, size) {
      return Err(HeapError::OutOfMemory { requested: size });
    }

    let bp = self.source.sbrk(size)?;
    self.obtained += size;
    let memory = self.source.memory_mut();

    block::set(memory, bp, Tag::free(size));
    let epilogue = block::next(memory, bp);
    block::write_tag(memory, block::header(epilogue), Tag::EPILOGUE);

    debug!(size, obtained = self.obtained, "heap extended");

    Ok(self.coalesce(bp))
  }

  /// Merges free block `bp` with free neighbours and leaves the cursor on
  /// the result.
  fn coalesce(
    &mut self,
    bp: usize,
  ) -> usize {
    let memory = self.source.memory_mut();
    let prev_allocated = block::read_tag(memory, bp - DSIZE).is_allocated();
    let next = block::next(memory, bp);
    let next_allocated = block::is_allocated(memory, next);
    let mut size = block::size(memory, bp);

    let merged = match (prev_allocated, next_allocated) {
      (true, true) => bp,
      (true, false) => {
        size += block::size(memory, next);
        block::set(memory, bp, Tag::free(size));
        bp
      }
      (false, true) => {
        let prev = block::prev(memory, bp);
        size += block::size(memory, prev);
        block::set(memory, prev, Tag::free(size));
        prev
      }
      (false, false) => {
        let prev = block::prev(memory, bp);
        size += block::size(memory, prev) + block::size(memory, next);
        block::set(memory, prev, Tag::free(size));
        prev
      }
    };

    trace!(offset = merged, size, prev_allocated, next_allocated, "coalesce");

    self.cursor = merged;
    merged
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn heap() -> Heap {
    Heap::with_config(HeapConfig::default().with_max_heap(1 << 16)).unwrap()
  }

  fn alloc(
    heap: &mut Heap,
    size: usize,
  ) -> HeapPtr {
    heap.allocate(size).unwrap().unwrap()
  }

  fn layout(heap: &Heap) -> Vec<(usize, bool)> {
    heap.blocks().map(|b| (b.size, b.allocated)).collect()
  }

  #[test]
  fn test_adjusted_size() {
    assert_eq!(adjusted_size(1), Ok(16));
    assert_eq!(adjusted_size(8), Ok(16));
    assert_eq!(adjusted_size(9), Ok(24));
    assert_eq!(adjusted_size(16), Ok(24));
    assert_eq!(adjusted_size(100), Ok(112));
    assert!(matches!(
      adjusted_size(usize::MAX),
      Err(HeapError::RequestTooLarge { .. })
    ));
    assert!(matches!(
      adjusted_size(MAX_BLOCK_SIZE),
      Err(HeapError::RequestTooLarge { .. })
    ));
  }

  #[test]
  fn test_tag_can_span() {
    assert!(tag_can_span(0, MAX_BLOCK_SIZE));
    assert!(tag_can_span(MAX_BLOCK_SIZE - 4096, 4096));
    assert!(!tag_can_span(MAX_BLOCK_SIZE - 4096, 4104));
    assert!(!tag_can_span(3 << 30, 3 << 30));
    assert!(!tag_can_span(usize::MAX, 8));
  }

  #[test]
  fn test_extend_refuses_to_outgrow_tags() {
    let mut heap = heap();
    let before = heap.check().unwrap();

    // Pretend the blocks already span almost all a tag can describe.
    heap.obtained = MAX_BLOCK_SIZE + FIXED_OVERHEAD - 8;
    assert_eq!(
      heap.extend(4096 / WSIZE),
      Err(HeapError::OutOfMemory { requested: 4096 })
    );
    assert_eq!(heap.source.brk(), before.heap_size);
  }

  #[test]
  fn test_heap_over_grown_source() {
    let mut arena = Arena::new(1 << 16);
    arena.sbrk(24).unwrap();

    let mut heap = Heap::new(arena, HeapConfig::default()).unwrap();
    assert_eq!(heap.prologue, 32);
    assert_eq!(heap.heap_size(), FIXED_OVERHEAD + 4096);

    let p = alloc(&mut heap, 100);
    assert_eq!(p.offset() % DSIZE, 0);
    let _q = alloc(&mut heap, 5000);
    heap.release(p);

    let stats = heap.check().unwrap();
    assert_eq!(stats.heap_size, heap.heap_size());
    assert_eq!(heap.source.brk(), 24 + heap.heap_size());
  }

  #[test]
  fn test_init_layout() {
    let heap = heap();

    assert_eq!(heap.heap_size(), FIXED_OVERHEAD + 4096);
    assert_eq!(layout(&heap), vec![(4096, false)]);
    assert_eq!(heap.cursor, heap.prologue);
    assert_eq!(heap.prologue, DSIZE);
  }

  #[test]
  fn test_zero_size() {
    let mut heap = heap();

    assert_eq!(heap.allocate(0), Ok(None));
    assert_eq!(layout(&heap), vec![(4096, false)]);
  }

  #[test]
  fn test_split_and_whole_placement() {
    let mut heap = heap();

    let p = alloc(&mut heap, 100);
    assert_eq!(p.offset(), 16);
    assert_eq!(heap.capacity(p), 104);
    assert_eq!(layout(&heap), vec![(112, true), (3984, false)]);

    // 3984 - 3976 = 8 is below the minimum block, so no split.
    let q = alloc(&mut heap, 3968);
    assert_eq!(layout(&heap), vec![(112, true), (3984, true)]);
    assert_eq!(heap.capacity(q), 3976);
  }

  #[test]
  fn test_reuse_after_release() {
    let mut heap = heap();

    let p = alloc(&mut heap, 100);
    heap.release(p);
    assert_eq!(layout(&heap), vec![(4096, false)]);

    let q = alloc(&mut heap, 100);
    assert_eq!(p, q);
  }

  #[test]
  fn test_coalesce_cases() {
    let mut heap = heap();

    let a = alloc(&mut heap, 24);
    let b = alloc(&mut heap, 24);
    let c = alloc(&mut heap, 24);
    let d = alloc(&mut heap, 24);
    let e = alloc(&mut heap, 24);

    // Neither neighbour free.
    heap.release(b);
    assert_eq!(heap.cursor, b.0);
    assert_eq!(
      layout(&heap),
      vec![(32, true), (32, false), (32, true), (32, true), (32, true), (3936, false)]
    );

    // Previous free.
    heap.release(c);
    assert_eq!(heap.cursor, b.0);
    assert_eq!(
      layout(&heap),
      vec![(32, true), (64, false), (32, true), (32, true), (3936, false)]
    );

    // Next free.
    heap.release(e);
    assert_eq!(heap.cursor, e.0);
    assert_eq!(layout(&heap), vec![(32, true), (64, false), (32, true), (3968, false)]);

    heap.release(a);
    assert_eq!(heap.cursor, a.0);
    assert_eq!(layout(&heap), vec![(96, false), (32, true), (3968, false)]);

    // Both free.
    heap.release(d);
    assert_eq!(heap.cursor, a.0);
    assert_eq!(layout(&heap), vec![(4096, false)]);

    heap.check().unwrap();
  }

  #[test]
  fn test_next_fit_resumes_after_cursor() {
    let mut heap = heap();

    let a = alloc(&mut heap, 16);
    let _b = alloc(&mut heap, 16);
    let c = alloc(&mut heap, 16);
    heap.release(a);
    assert_eq!(heap.cursor, a.0);

    // The forward pass starts after the cursor, so the tail wins over `a`.
    let d = alloc(&mut heap, 16);
    assert!(d > c);

    // Fill the tail exactly; only the wrap pass is left.
    let tail = heap.blocks().last().unwrap();
    assert!(!tail.allocated);
    let e = alloc(&mut heap, tail.size - DSIZE);
    assert_eq!(e, tail.ptr);

    let f = alloc(&mut heap, 16);
    assert_eq!(f, a);
  }

  #[test]
  fn test_extend_merges_with_free_tail() {
    let mut heap = heap();

    let p = alloc(&mut heap, 1000);
    let q = alloc(&mut heap, 5000);

    // The 3088-byte free tail and the new chunk became one block.
    assert_eq!(q.offset(), p.offset() + 1008);
    assert_eq!(heap.heap_size(), FIXED_OVERHEAD + 4096 + 5008);
    heap.check().unwrap();
  }

  #[test]
  fn test_exhaustion_leaves_heap_valid() {
    let mut heap = Heap::with_config(HeapConfig::default().with_max_heap(8192)).unwrap();

    let p = alloc(&mut heap, 2000);
    heap.payload_mut(p).fill(0xAB);
    let before = heap.check().unwrap();

    assert_eq!(
      heap.allocate(10_000),
      Err(HeapError::OutOfMemory { requested: 10_008 })
    );
    assert_eq!(heap.check().unwrap(), before);
    assert!(heap.payload(p).iter().all(|&b| b == 0xAB));

    assert!(alloc(&mut heap, 100) > p);
  }

  #[test]
  fn test_resize_shrink_keeps_pointer() {
    let mut heap = heap();

    let p = alloc(&mut heap, 200);
    heap.payload_mut(p)[..200].copy_from_slice(&[7u8; 200]);

    assert_eq!(heap.resize(p, 50), Ok(Some(p)));
    assert_eq!(heap.resize(p, 200), Ok(Some(p)));
    assert!(heap.payload(p)[..200].iter().all(|&b| b == 7));
  }

  #[test]
  fn test_resize_absorbs_free_neighbour() {
    let mut heap = heap();

    let p = alloc(&mut heap, 100);
    assert_eq!(heap.resize(p, 400), Ok(Some(p)));
    assert_eq!(layout(&heap), vec![(4096, true)]);
  }

  #[test]
  fn test_resize_absorb_repairs_cursor() {
    let mut heap = heap();

    let p = alloc(&mut heap, 32);
    let q = alloc(&mut heap, 32);
    let _r = alloc(&mut heap, 32);
    heap.release(q);
    assert_eq!(heap.cursor, q.0);

    assert_eq!(heap.resize(p, 64), Ok(Some(p)));
    assert_eq!(heap.cursor, p.0);
    heap.check().unwrap();

    let s = alloc(&mut heap, 32);
    assert!(s > p);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_moves_and_copies() {
    let mut heap = heap();

    let p = alloc(&mut heap, 16);
    let _guard = alloc(&mut heap, 16);
    heap.payload_mut(p)[..16].copy_from_slice(b"0123456789abcdef");

    let q = heap.resize(p, 64).unwrap().unwrap();
    assert_ne!(p, q);
    assert_eq!(&heap.payload(q)[..16], b"0123456789abcdef");
    assert!(!heap.blocks().find(|b| b.ptr == p).unwrap().allocated);
    heap.check().unwrap();
  }

  #[test]
  fn test_resize_failure_keeps_block() {
    let mut heap = Heap::with_config(HeapConfig::default().with_max_heap(4096 + 16)).unwrap();

    let p = alloc(&mut heap, 16);
    let _guard = alloc(&mut heap, 16);
    heap.payload_mut(p).fill(3);

    assert!(matches!(
      heap.resize(p, 8000),
      Err(HeapError::OutOfMemory { .. })
    ));
    assert!(heap.blocks().find(|b| b.ptr == p).unwrap().allocated);
    assert!(heap.payload(p).iter().all(|&b| b == 3));
  }

  #[test]
  fn test_resize_zero_releases() {
    let mut heap = heap();

    let p = alloc(&mut heap, 16);
    assert_eq!(heap.resize(p, 0), Ok(None));
    assert_eq!(layout(&heap), vec![(4096, false)]);
  }

  #[test]
  fn test_reclaim_shrink() {
    let config = HeapConfig::default()
      .with_max_heap(1 << 16)
      .with_slack(SlackPolicy::Reclaim);
    let mut heap = Heap::with_config(config).unwrap();

    let p = alloc(&mut heap, 200);
    assert_eq!(heap.resize(p, 50), Ok(Some(p)));

    // The 144 spare bytes merged with the free tail.
    assert_eq!(layout(&heap), vec![(64, true), (4032, false)]);
    heap.check().unwrap();
  }

  #[test]
  fn test_reclaim_absorb_trims() {
    let config = HeapConfig::default()
      .with_max_heap(1 << 16)
      .with_slack(SlackPolicy::Reclaim);
    let mut heap = Heap::with_config(config).unwrap();

    let p = alloc(&mut heap, 100);
    assert_eq!(heap.resize(p, 400), Ok(Some(p)));
    assert_eq!(layout(&heap), vec![(408, true), (3688, false)]);
    heap.check().unwrap();
  }
}
