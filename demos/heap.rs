use std::io::Read;

use tagalloc::{Allocator, BlockState, MB, MemoryInfo};

#[repr(C)]
struct Dummy {
  a: usize,
  b: i32,
  c: f32,
}

/// Waits until the user presses ENTER when running with `--step`.
/// Useful for watching the reservation and its committed pages with `pmap`
/// between steps.
fn step(paused: bool) {
  if paused {
    println!("\n>>> Press ENTER to continue...");
    let _ = std::io::stdin().bytes().next();
  }
}

fn print_heap(
  label: &str,
  allocator: &Allocator,
) {
  println!(
    "\n[{}] PID = {}, heap size = {} of {} bytes",
    label,
    std::process::id(),
    allocator.heap_size(),
    allocator.heap_max_size(),
  );
  allocator.print_blocks();
}

fn main() {
  let paused = std::env::args().any(|arg| arg == "--step");

  let info = MemoryInfo::query();
  println!(
    "total memory: {}, available memory: {}, page size: {}",
    info.total_physical, info.available_physical, info.page_size
  );

  // Never reserve more than the machine could back.
  let max_size = (4 * MB).min(info.available_physical.max(info.page_size));
  let mut allocator = Allocator::create(max_size).expect("failed to reserve the heap");

  print_heap("start", &allocator);
  step(paused);

  // --------------------------------------------------------------------
  // 1) A small record array. The first allocation commits the first page.
  // --------------------------------------------------------------------
  let count = 16;
  let vector = allocator
    .alloc(std::mem::size_of::<Dummy>() * count)
    .expect("out of memory")
    .expect("non-zero size")
    .cast::<Dummy>();

  unsafe {
    vector.as_ptr().write(Dummy { a: 10, b: -4, c: 1.2 });
    vector.as_ptr().add(count - 1).write(Dummy { a: 15, b: -15, c: 1.15 });

    let first = &*vector.as_ptr();
    let last = &*vector.as_ptr().add(count - 1);
    println!("\n[1] vector[0] = ({}, {}, {})", first.a, first.b, first.c);
    println!("[1] vector[15] = ({}, {}, {})", last.a, last.b, last.c);
  }

  print_heap("1", &allocator);
  step(paused);

  // --------------------------------------------------------------------
  // 2) Free it again. Everything merges back into one free block.
  // --------------------------------------------------------------------
  unsafe { allocator.free(Some(vector.cast())) };
  print_heap("2", &allocator);
  step(paused);

  // --------------------------------------------------------------------
  // 3) Ten tiny blocks, then free every other one. Freed blocks stay apart
  //    because allocated blocks sit between them.
  // --------------------------------------------------------------------
  let blocks: Vec<_> = (1..=10)
    .map(|size| allocator.alloc(size).expect("out of memory"))
    .collect();

  for block in blocks.iter().skip(1).step_by(2) {
    unsafe { allocator.free(*block) };
  }

  print_heap("3", &allocator);
  step(paused);

  // --------------------------------------------------------------------
  // 4) Free the block between two free ones: all three merge.
  // --------------------------------------------------------------------
  unsafe { allocator.free(blocks[2]) };
  print_heap("4", &allocator);

  let free = allocator
    .dump()
    .iter()
    .filter(|info| info.state == BlockState::Free)
    .count();
  println!("[4] {} free blocks", free);
  step(paused);

  // --------------------------------------------------------------------
  // 5) Something larger than a page forces the heap to grow.
  // --------------------------------------------------------------------
  let big = allocator.alloc(3 * info.page_size).expect("out of memory");
  print_heap("5", &allocator);

  if let Err(violation) = allocator.verify() {
    println!("heap is corrupted: {violation}");
  }

  unsafe { allocator.free(big) };

  // --------------------------------------------------------------------
  // 6) End of demo. Dropping the allocator unmaps the reservation.
  // --------------------------------------------------------------------
  println!("\n[6] End of example, dropping the allocator.");
}
