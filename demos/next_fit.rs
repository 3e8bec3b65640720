use std::io::Read;

use anyhow::{Context, Result};
use libc::sbrk;
use nextfit::{Heap, HeapConfig, HeapPtr, MemorySource, ProgramBreak};
use tracing_subscriber::EnvFilter;

/// Waits until the user presses ENTER when `--step` was given.
/// Useful when you want to inspect memory state with tools like `pmap` or
/// `gdb` between steps.
fn block_until_enter_pressed(step: bool) {
  if step {
    println!("\n>>> Press ENTER to continue...");
    let _ = std::io::stdin().bytes().next();
  }
}

/// Prints the current program break using `sbrk(0)`.
fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn print_alloc<S: MemorySource>(
  heap: &Heap<S>,
  size: usize,
  ptr: HeapPtr,
) {
  println!(
    "Allocated {} bytes (capacity {}), offset = {:#x}, address = {:?}, heap size = {}",
    size,
    heap.capacity(ptr),
    ptr.offset(),
    heap.as_ptr(ptr),
    heap.heap_size(),
  );
}

fn allocate<S: MemorySource>(
  heap: &mut Heap<S>,
  size: usize,
) -> Result<HeapPtr> {
  let ptr = heap
    .allocate(size)?
    .context("non-zero allocation returned no block")?;
  print_alloc(heap, size, ptr);
  Ok(ptr)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let step = std::env::args().any(|arg| arg == "--step");

  print_program_break("start");

  let source = ProgramBreak::new(1 << 24).context("could not claim the program break")?;
  let mut heap = Heap::new(source, HeapConfig::default())?;

  print_program_break("after init");
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 1) Two small blocks land next to each other in the first chunk.
  // --------------------------------------------------------------------
  println!("\n[1] Allocate two 100-byte blocks");
  let first = allocate(&mut heap, 100)?;
  let _second = allocate(&mut heap, 100)?;
  heap.payload_mut(first)[..4].copy_from_slice(&0xDEADBEEFu32.to_ne_bytes());
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 2) Release the first block; the cursor now rests on it, so the next
  //    search starts after it.
  // --------------------------------------------------------------------
  heap.release(first);
  println!("\n[2] Released first block, cursor = {:#x}", heap.cursor().offset());
  let third = allocate(&mut heap, 16)?;
  println!(
    "[2] third == first? {}",
    if third == first { "yes, reused" } else { "no, next-fit moved on" }
  );
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 3) `third` was carved from the front of the free tail, so growing it
  //    absorbs the rest of the tail without a copy.
  // --------------------------------------------------------------------
  let grown = heap.resize(third, 400)?.context("resize returned no block")?;
  println!(
    "\n[3] Resized third block to 400 bytes: {}",
    if grown == third { "in place" } else { "moved" }
  );
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 4) A request larger than the chunk forces the heap to grow.
  // --------------------------------------------------------------------
  print_program_break("before large alloc");
  println!("\n[4] Allocate 64 KiB");
  allocate(&mut heap, 64 * 1024)?;
  print_program_break("after large alloc");

  let stats = heap.check()?;
  println!("\n[5] {:#?}", stats);

  println!("\n[6] End of example. Dropping the heap hands the break back.");
  Ok(())
}
