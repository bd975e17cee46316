use std::ptr::NonNull;

use crate::{
  Pointer,
  align,
  block::{BLOCK_OVERHEAD, BlockRef, MIN_BLOCK_SIZE},
  directory::{self, BlockDirectory},
  error::AllocError,
  reservation::HeapReservation,
};

/// First-fit allocator over one reserved range of address space.
///
/// Free and allocated blocks tile the committed part of the reservation and
/// are threaded onto two address ordered lists. Allocation takes the first
/// free block that is large enough and splits off whatever it does not need;
/// freeing merges the block with free neighbors on both sides, so two free
/// blocks are never adjacent. When no free block fits, more pages of the
/// reservation are committed.
///
/// The allocator is not thread safe and holds a raw pointer, so it is neither
/// [`Send`] nor [`Sync`]. Dropping it unmaps the whole reservation, which
/// invalidates every pointer it handed out.
pub struct Allocator {
  pub(crate) heap: HeapReservation,
  pub(crate) blocks: BlockDirectory,
}

/// A free block large enough for a request, with its free list predecessor so
/// it can be unlinked without walking the list again.
#[derive(Clone, Copy, Debug)]
struct Fit {
  previous: Option<BlockRef>,
  block: BlockRef,
}

impl Allocator {
  /// Reserves `max_size` bytes of address space. Nothing is committed until
  /// the first allocation, and the heap can never grow past `max_size`.
  pub fn create(max_size: usize) -> Result<Self, AllocError> {
    let heap = HeapReservation::new(max_size)?;

    log::debug!(
      "reserved {} bytes at {:?}, page size {}",
      max_size,
      heap.start(),
      heap.page_size()
    );

    Ok(Self {
      heap,
      blocks: BlockDirectory::new(),
    })
  }

  /// Address of the first byte of the reservation.
  pub fn heap_start(&self) -> NonNull<u8> {
    self.heap.start()
  }

  /// Bytes committed so far. Always a multiple of [`Self::page_size`].
  pub fn heap_size(&self) -> usize {
    self.heap.size()
  }

  /// Upper bound for [`Self::heap_size`].
  pub fn heap_max_size(&self) -> usize {
    self.heap.max_size()
  }

  pub fn page_size(&self) -> usize {
    self.heap.page_size()
  }

  /// Allocates at least `size` bytes aligned to the pointer size. The memory
  /// is not zeroed.
  ///
  /// Returns `Ok(None)` for `size == 0` without touching the heap. If the heap
  /// cannot grow enough the call fails with [`AllocError::OutOfMemory`] and
  /// nothing changes.
  pub fn alloc(
    &mut self,
    size: usize,
  ) -> Result<Pointer<u8>, AllocError> {
    if size == 0 {
      return Ok(None);
    }

    let result = self.allocate_block(size);

    match result {
      Ok(block) => {
        let address = self.heap.address_of(block.payload());
        log::trace!("alloc({}) -> {:?}", size, address);

        Ok(Some(address))
      }
      Err(error) => {
        log::warn!("alloc({}) -> {}", size, error);

        Err(error)
      }
    }
  }

  fn allocate_block(
    &mut self,
    size: usize,
  ) -> Result<BlockRef, AllocError> {
    let out_of_memory = AllocError::OutOfMemory { requested: size };

    let size = align::checked_word_align(size).ok_or(out_of_memory)?;
    let total_size = size.checked_add(BLOCK_OVERHEAD).ok_or(out_of_memory)?;

    let Fit { previous, block } = match self.first_fit(size) {
      Ok(fit) => fit,
      Err(before_last) => self.expand(total_size, before_last).map_err(|_| out_of_memory)?,
    };

    if self.heap.size_of(block) >= total_size.saturating_add(MIN_BLOCK_SIZE) {
      self.split(previous, block, size);
    } else {
      // Too small to leave a usable remainder, the caller gets the padding
      // too.
      self.blocks.free.remove_after(&mut self.heap, previous, block);
    }

    self.make_allocated(block);

    Ok(block)
  }

  /// Releases memory returned by [`Self::alloc`]. `None` is ignored.
  ///
  /// # Safety
  ///
  /// `address` must have been returned by `alloc` on this same allocator and
  /// must not have been freed since. Anything else (foreign pointers, double
  /// frees, pointers into the middle of an allocation) is undefined behaviour
  /// and will usually corrupt the heap.
  pub unsafe fn free(
    &mut self,
    address: Pointer<u8>,
  ) {
    let Some(address) = address else {
      return;
    };

    let block = BlockRef::from_payload(self.heap.offset_of(address));
    debug_assert!(!self.heap.is_free(block), "double free of {address:?}");

    log::trace!("free({:?}) size={}", address, self.heap.size_of(block));

    let previous_allocated = directory::nearest_preceding_allocated(&self.heap, block);
    self.blocks.allocated.remove_after(&mut self.heap, previous_allocated, block);

    self.heap.set_free(block, true);

    let previous = directory::nearest_preceding_free(&self.heap, block);
    let next = match previous {
      Some(previous) => self.heap.next_of(previous),
      None => self.blocks.free.first,
    };

    let mut current = block;

    match previous {
      Some(previous) if self.heap.previous_header_of(block) == Some(previous) => {
        // The block below is free: grow it over this one. It keeps its list
        // position, so nothing is linked.
        let size = self.heap.size_of(previous) + BLOCK_OVERHEAD + self.heap.size_of(block);
        self.heap.resize(previous, size);
        current = previous;
      }
      _ => self.blocks.free.insert_after(&mut self.heap, previous, block),
    }

    if let Some(next) = next {
      if self.heap.next_header_of(current) == Some(next) {
        // The block above is free too: absorb it and drop it from the list.
        // It is `current`'s list successor at this point.
        self.blocks.free.remove_after(&mut self.heap, Some(current), next);
        let size = self.heap.size_of(current) + BLOCK_OVERHEAD + self.heap.size_of(next);
        self.heap.resize(current, size);
      }
    }
  }

  /// Payload bytes available behind `address`. At least the size passed to
  /// [`Self::alloc`], possibly more when a split was not worth it.
  ///
  /// # Safety
  ///
  /// Same contract as [`Self::free`]: `address` must be a live allocation of
  /// this allocator.
  pub unsafe fn usable_size(
    &self,
    address: NonNull<u8>,
  ) -> usize {
    self.heap.size_of(BlockRef::from_payload(self.heap.offset_of(address)))
  }

  /// Walks the free list and returns the first block with at least `size`
  /// payload bytes. On a miss the whole list has been walked, so the error
  /// carries the list predecessor of the last free block.
  fn first_fit(
    &self,
    size: usize,
  ) -> Result<Fit, Option<BlockRef>> {
    let mut before_last = None;
    let mut previous = None;

    for block in self.blocks.free.iter(&self.heap) {
      if self.heap.size_of(block) >= size {
        return Ok(Fit { previous, block });
      }
      before_last = previous;
      previous = Some(block);
    }

    Err(before_last)
  }

  /// Commits enough pages to fit a block of `total_size` bytes (payload plus
  /// overhead) and returns the free block that now has room for it.
  ///
  /// If the last free block ends exactly where the heap ends, the new pages
  /// extend it, so only the missing part has to be committed. Otherwise the
  /// new pages become a free block of their own at the tail of the free list.
  /// `before_last` is the list predecessor of the current last free block.
  fn expand(
    &mut self,
    total_size: usize,
    before_last: Option<BlockRef>,
  ) -> Result<Fit, AllocError> {
    let heap_end = self.heap.size();

    let trailing = self
      .blocks
      .free
      .last
      .filter(|&last| self.heap.end_of(last) == heap_end);

    let missing = match trailing {
      Some(last) => total_size.saturating_sub(self.heap.size_of(last)),
      None => total_size,
    };

    let committed = self.heap.grow(missing)?;

    log::debug!(
      "heap grew by {} bytes to {} bytes",
      committed,
      self.heap.size()
    );

    match trailing {
      Some(last) => {
        let size = self.heap.size_of(last) + committed;
        self.heap.resize(last, size);

        debug_assert_eq!(
          before_last,
          directory::nearest_preceding_free(&self.heap, last)
        );

        Ok(Fit {
          previous: before_last,
          block: last,
        })
      }
      None => {
        let block = BlockRef::at(heap_end);
        let previous = self.blocks.free.last;

        self.heap.format(block, committed - BLOCK_OVERHEAD, true, None);
        self.blocks.free.insert_after(&mut self.heap, previous, block);

        Ok(Fit { previous, block })
      }
    }
  }

  /// Shrinks the free `block` to `size` bytes and turns the rest into a new
  /// free block that takes its place in the free list.
  ///
  /// ```text
  ///   Before:  | H |            free (block.size)             | F |
  ///
  ///   After:   | H |  size  | F | H |   free (remainder)       | F |
  ///            ^                  ^
  ///            block              remainder
  /// ```
  fn split(
    &mut self,
    previous: Option<BlockRef>,
    block: BlockRef,
    size: usize,
  ) {
    let remainder_size = self.heap.size_of(block) - size - BLOCK_OVERHEAD;
    let remainder = BlockRef::at(block.offset() + BLOCK_OVERHEAD + size);

    self.heap.format(remainder, remainder_size, true, None);
    self.blocks.free.replace(&mut self.heap, previous, block, remainder);
    self.heap.resize(block, size);
  }

  /// Flags `block` as allocated and links it into the allocated list at its
  /// address ordered position.
  fn make_allocated(
    &mut self,
    block: BlockRef,
  ) {
    self.heap.set_free(block, false);

    // The predecessor comes from the heap layout, never from comparing
    // against the list head: a block below the current head must become the
    // new head.
    let previous = directory::nearest_preceding_allocated(&self.heap, block);
    self.blocks.allocated.insert_after(&mut self.heap, previous, block);

    debug_assert!(previous.is_none_or(|previous| previous < block));
    debug_assert!(self.heap.next_of(block).is_none_or(|next| block < next));
  }
}

#[cfg(test)]
mod tests {
  use std::mem;

  use rand::{Rng, SeedableRng, rngs::StdRng};

  use super::*;
  use crate::{
    KB, MB, align,
    block::{HEADER_SIZE, WORD_SIZE},
    dump::BlockState,
  };

  fn allocator() -> Allocator {
    Allocator::create(MB).unwrap()
  }

  fn check(allocator: &Allocator) {
    if let Err(violation) = allocator.verify() {
      panic!("{violation}\n{:#?}", allocator.dump());
    }
  }

  fn payloads(allocator: &Allocator) -> Vec<(BlockState, usize)> {
    allocator
      .dump()
      .into_iter()
      .map(|info| (info.state, info.size))
      .collect()
  }

  #[test]
  fn test_create_commits_nothing() {
    let allocator = allocator();

    assert_eq!(allocator.heap_size(), 0);
    assert_eq!(allocator.heap_max_size(), MB);
    assert!(allocator.dump().is_empty());
    check(&allocator);
  }

  #[test]
  fn test_create_fails_without_address_space() {
    assert_eq!(
      Allocator::create(0).err(),
      Some(AllocError::Reserve { size: 0 })
    );
  }

  #[test]
  fn test_zero_size_is_none() {
    let mut allocator = allocator();

    assert_eq!(allocator.alloc(0), Ok(None));
    assert_eq!(allocator.heap_size(), 0);

    allocator.alloc(24).unwrap();
    let before = allocator.dump();

    assert_eq!(allocator.alloc(0), Ok(None));
    assert_eq!(allocator.dump(), before);
  }

  #[test]
  fn test_first_alloc_splits_first_page() {
    let mut allocator = allocator();
    let page = allocator.page_size();

    let address = allocator.alloc(1).unwrap().unwrap();

    assert_eq!(allocator.heap_size(), page);
    assert_eq!(address.as_ptr() as usize % mem::size_of::<usize>(), 0);
    assert_eq!(
      address.as_ptr() as usize - allocator.heap_start().as_ptr() as usize,
      HEADER_SIZE
    );
    assert_eq!(
      payloads(&allocator),
      vec![
        (BlockState::Allocated, WORD_SIZE),
        (BlockState::Free, page - WORD_SIZE - 2 * BLOCK_OVERHEAD),
      ]
    );
    check(&allocator);
  }

  #[test]
  fn test_memory_is_usable() {
    let mut allocator = allocator();
    let mut live = Vec::new();

    for size in [1, 7, 8, 13, 64, 100, 3000, 5000] {
      let address = allocator.alloc(size).unwrap().unwrap();
      unsafe {
        assert!(allocator.usable_size(address) >= align!(size));
        address.as_ptr().write_bytes(size as u8, size);
      }
      live.push((address, size));
    }

    check(&allocator);

    for (address, size) in live {
      let bytes = unsafe { std::slice::from_raw_parts(address.as_ptr(), size) };
      assert!(bytes.iter().all(|&byte| byte == size as u8));
    }
  }

  #[test]
  fn test_reuses_freed_block() {
    let mut allocator = allocator();

    let first = allocator.alloc(32).unwrap();
    let _second = allocator.alloc(32).unwrap();

    unsafe { allocator.free(first) };
    check(&allocator);

    let third = allocator.alloc(16).unwrap();
    assert_eq!(third, first);
    check(&allocator);
  }

  #[test]
  fn test_takes_whole_block_when_remainder_too_small() {
    let mut allocator = allocator();

    let first = allocator.alloc(40).unwrap();
    let _guard = allocator.alloc(8).unwrap();
    unsafe { allocator.free(first) };

    // 40 bytes free; 32 + overhead + minimum does not fit, so no split.
    let again = allocator.alloc(32).unwrap().unwrap();

    assert_eq!(Some(again), first);
    assert_eq!(unsafe { allocator.usable_size(again) }, 40);
    check(&allocator);
  }

  #[test]
  fn test_free_none_is_noop() {
    let mut allocator = allocator();
    allocator.alloc(8).unwrap();
    let before = allocator.dump();

    unsafe { allocator.free(None) };

    assert_eq!(allocator.dump(), before);
  }

  #[test]
  fn test_scattered_frees_then_merge() {
    let mut allocator = allocator();

    let addresses: Vec<_> = (1..=10)
      .map(|size| allocator.alloc(size).unwrap())
      .collect();

    for address in addresses.iter().skip(1).step_by(2) {
      unsafe { allocator.free(*address) };
      check(&allocator);
    }

    let dump = allocator.dump();
    let allocated = dump.iter().filter(|info| info.state == BlockState::Allocated);
    assert_eq!(allocated.count(), 5);

    for pair in dump.windows(2) {
      assert!(!(pair[0].state == BlockState::Free && pair[1].state == BlockState::Free));
    }

    // Block 3 (index 2) sits between freed blocks 2 and 4.
    let left = unsafe { allocator.usable_size(addresses[1].unwrap()) };
    let middle = unsafe { allocator.usable_size(addresses[2].unwrap()) };
    let right = unsafe { allocator.usable_size(addresses[3].unwrap()) };
    let blocks_before = allocator.dump().len();

    unsafe { allocator.free(addresses[2]) };
    check(&allocator);

    let merged = allocator
      .dump()
      .into_iter()
      .find(|info| info.address == addresses[1].unwrap().as_ptr() as usize - HEADER_SIZE)
      .unwrap();

    assert_eq!(merged.state, BlockState::Free);
    assert_eq!(merged.size, left + middle + right + 2 * BLOCK_OVERHEAD);
    assert_eq!(allocator.dump().len(), blocks_before - 2);
  }

  #[test]
  fn test_growth_crosses_page_boundary() {
    let mut allocator = allocator();
    let page = allocator.page_size();

    allocator.alloc(page / 2).unwrap();
    assert_eq!(allocator.heap_size(), page);

    // Does not fit in what is left of the first page, so the trailing free
    // block gets extended by exactly one page.
    let address = allocator.alloc(page / 2 + 64).unwrap().unwrap();

    assert_eq!(allocator.heap_size(), 2 * page);
    assert_eq!(allocator.heap_size() % page, 0);
    assert!(unsafe { allocator.usable_size(address) } >= page / 2 + 64);
    check(&allocator);
  }

  #[test]
  fn test_growth_appends_block_after_allocation() {
    let mut allocator = allocator();
    let page = allocator.page_size();

    // Exactly fills the first page, so no trailing free block is left.
    let whole = page - BLOCK_OVERHEAD;
    allocator.alloc(whole).unwrap();
    assert!(allocator.free_blocks().next().is_none());

    let address = allocator.alloc(16).unwrap().unwrap();

    assert_eq!(allocator.heap_size(), 2 * page);
    assert_eq!(
      address.as_ptr() as usize - allocator.heap_start().as_ptr() as usize,
      page + HEADER_SIZE
    );
    check(&allocator);
  }

  #[test]
  fn test_large_allocation_spans_pages() {
    let mut allocator = allocator();
    let page = allocator.page_size();

    let address = allocator.alloc(3 * page + 1).unwrap().unwrap();
    unsafe { address.as_ptr().write_bytes(0x5A, 3 * page + 1) };

    assert_eq!(allocator.heap_size(), 4 * page);
    check(&allocator);

    unsafe { allocator.free(Some(address)) };
    check(&allocator);

    assert_eq!(
      payloads(&allocator),
      vec![(BlockState::Free, 4 * page - BLOCK_OVERHEAD)]
    );
  }

  #[test]
  fn test_out_of_memory_changes_nothing() {
    let page = crate::platform::page_size();
    let mut allocator = Allocator::create(2 * page).unwrap();

    let kept = allocator.alloc(64).unwrap();
    let before = allocator.dump();
    let heap_size = allocator.heap_size();

    assert_eq!(
      allocator.alloc(2 * page),
      Err(AllocError::OutOfMemory { requested: 2 * page })
    );
    assert_eq!(
      allocator.alloc(usize::MAX - 3),
      Err(AllocError::OutOfMemory { requested: usize::MAX - 3 })
    );

    assert_eq!(allocator.dump(), before);
    assert_eq!(allocator.heap_size(), heap_size);
    check(&allocator);

    // Smaller requests still work and the heap may use the whole reservation.
    // Growth asks for the request plus overhead minus the trailing free block,
    // so this is the largest request that fits.
    unsafe { allocator.free(kept) };
    let all = allocator.alloc(2 * page - 2 * BLOCK_OVERHEAD).unwrap();
    assert!(all.is_some());
    assert_eq!(allocator.heap_size(), allocator.heap_max_size());
    check(&allocator);
  }

  #[test]
  fn test_growth_keeps_free_list_links() {
    let mut allocator = allocator();
    let page = allocator.page_size();

    let a = allocator.alloc(16).unwrap();
    let _b = allocator.alloc(16).unwrap();
    let c = allocator.alloc(16).unwrap();
    let _d = allocator.alloc(16).unwrap();

    unsafe {
      allocator.free(a);
      allocator.free(c);
    }

    let trailing = allocator.free_blocks().last().unwrap();

    // Misses every free block, so the trailing one is extended and split.
    // Its predecessor on the free list is `c`, which must still link to it.
    let big = allocator.alloc(page).unwrap().unwrap();
    check(&allocator);

    assert_eq!(big.as_ptr() as usize, trailing + HEADER_SIZE);
    assert_eq!(allocator.heap_size(), 2 * page);

    let free: Vec<_> = allocator.free_blocks().collect();
    assert_eq!(free.len(), 3);
    assert_eq!(free[0] + HEADER_SIZE, a.unwrap().as_ptr() as usize);
    assert_eq!(free[1] + HEADER_SIZE, c.unwrap().as_ptr() as usize);
    assert!(free[2] > trailing);
  }

  #[test]
  fn test_unaligned_max_size_stops_at_last_page() {
    let page = crate::platform::page_size();

    for seed in [1, 0xBEEF, 0x5EED, 99, 2024] {
      let mut rng = StdRng::seed_from_u64(seed);
      let mut allocator = Allocator::create(3 * page + 100).unwrap();
      let mut live = Vec::new();
      let mut failures = 0;

      for _ in 0..1500 {
        if live.is_empty() || rng.random_bool(0.65) {
          let size = rng.random_range(1..page);
          let before = allocator.dump();
          let heap_size = allocator.heap_size();

          match allocator.alloc(size) {
            Ok(address) => live.push(address),
            Err(error) => {
              assert_eq!(error, AllocError::OutOfMemory { requested: size });
              assert_eq!(allocator.dump(), before);
              assert_eq!(allocator.heap_size(), heap_size);
              failures += 1;
            }
          }
        } else {
          let address = live.swap_remove(rng.random_range(0..live.len()));
          unsafe { allocator.free(address) };
        }

        check(&allocator);
        assert!(allocator.heap_size() <= 3 * page);
        assert_eq!(allocator.heap_size() % page, 0);
      }

      assert!(failures > 0, "seed {seed} never ran out of memory");
    }
  }

  #[test]
  fn test_allocated_list_stays_ordered_below_head() {
    let mut allocator = allocator();

    let a = allocator.alloc(16).unwrap();
    let b = allocator.alloc(16).unwrap();
    let c = allocator.alloc(16).unwrap();

    unsafe {
      allocator.free(a);
      allocator.free(b);
    }

    // `c` is now the head of the allocated list; this lands below it.
    let d = allocator.alloc(8).unwrap();
    assert_eq!(d, a);

    let order: Vec<_> = allocator.allocated_blocks().collect();
    assert_eq!(order.len(), 2);
    assert!(order[0] < order[1]);
    assert_eq!(order[0] + HEADER_SIZE, d.unwrap().as_ptr() as usize);
    assert_eq!(order[1] + HEADER_SIZE, c.unwrap().as_ptr() as usize);
    check(&allocator);
  }

  #[test]
  fn test_free_everything_leaves_one_block() {
    let mut allocator = allocator();

    let addresses: Vec<_> = (0..50)
      .map(|i| allocator.alloc(8 + i * 24).unwrap())
      .collect();

    for address in addresses.iter().rev().step_by(3) {
      unsafe { allocator.free(*address) };
    }
    for (i, address) in addresses.iter().enumerate() {
      if (addresses.len() - 1 - i) % 3 != 0 {
        unsafe { allocator.free(*address) };
      }
    }

    check(&allocator);
    assert_eq!(
      payloads(&allocator),
      vec![(BlockState::Free, allocator.heap_size() - BLOCK_OVERHEAD)]
    );
  }

  #[test]
  fn test_randomized_alloc_free() {
    for seed in [0x42, 0xC0FFEE, 7] {
      let mut rng = StdRng::seed_from_u64(seed);
      let mut allocator = Allocator::create(4 * MB).unwrap();
      let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

      for step in 0..2000 {
        if live.is_empty() || rng.random_bool(0.6) {
          let size = match rng.random_range(0..10) {
            0 => rng.random_range(KB..16 * KB),
            _ => rng.random_range(1..256),
          };

          let address = allocator.alloc(size).unwrap().unwrap();
          let tag = step as u8;

          assert_eq!(address.as_ptr() as usize % WORD_SIZE, 0);
          unsafe {
            assert!(allocator.usable_size(address) >= align!(size));
            address.as_ptr().write_bytes(tag, size);
          }
          live.push((address, size, tag));
        } else {
          let (address, size, tag) = live.swap_remove(rng.random_range(0..live.len()));
          let bytes = unsafe { std::slice::from_raw_parts(address.as_ptr(), size) };
          assert!(bytes.iter().all(|&byte| byte == tag), "payload clobbered");

          unsafe { allocator.free(Some(address)) };
        }

        check(&allocator);
        assert!(allocator.heap_size() <= allocator.heap_max_size());
      }

      for (address, _, _) in live.drain(..) {
        unsafe { allocator.free(Some(address)) };
        check(&allocator);
      }

      assert_eq!(allocator.dump().len(), 1);
    }
  }
}
