//! Heap introspection. Nothing here is needed for allocating or freeing, it
//! exists for tests, debugging and the demo driver.

use std::{fmt, iter};

use crate::{
  allocator::Allocator,
  block::{BLOCK_OVERHEAD, BlockRef, FOOTER_SIZE, HEADER_SIZE},
  directory::BlockList,
  error::{HeapViolation, ListKind},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
  Free,
  Allocated,
}

/// One entry of [`Allocator::dump`]. Addresses are absolute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Address of the block header. The payload starts right after it.
  pub address: usize,
  pub state: BlockState,
  /// Payload size, excluding header and footer.
  pub size: usize,
  /// Header address of the next block on the same list.
  pub next: Option<usize>,
}

impl fmt::Display for BlockInfo {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    let state = match self.state {
      BlockState::Free => "free",
      BlockState::Allocated => "allocated",
    };

    write!(f, "{:#x} {} node: {}", self.address, state, self.size)?;

    match self.next {
      Some(next) => write!(f, " -> {next:#x}"),
      None => Ok(()),
    }
  }
}

impl Allocator {
  /// Every block in ascending address order.
  pub fn dump(&self) -> Vec<BlockInfo> {
    let base = self.heap.start().as_ptr() as usize;

    self
      .walk()
      .map(|block| {
        let header = self.heap.block(block);

        BlockInfo {
          address: base + block.offset(),
          state: if header.is_free { BlockState::Free } else { BlockState::Allocated },
          size: header.size,
          next: header.next.map(|next| base + next.offset()),
        }
      })
      .collect()
  }

  /// Prints [`Self::dump`] to stdout, one block per line.
  pub fn print_blocks(&self) {
    for info in self.dump() {
      println!("{info}");
    }
  }

  /// Header addresses of the free list, in list order.
  pub fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
    self.list_addresses(self.blocks.free)
  }

  /// Header addresses of the allocated list, in list order.
  pub fn allocated_blocks(&self) -> impl Iterator<Item = usize> + '_ {
    self.list_addresses(self.blocks.allocated)
  }

  fn list_addresses(
    &self,
    list: BlockList,
  ) -> impl Iterator<Item = usize> + '_ {
    let base = self.heap.start().as_ptr() as usize;

    list.iter(&self.heap).map(move |block| base + block.offset())
  }

  /// Walks the heap by boundary tags, lowest address first.
  fn walk(&self) -> impl Iterator<Item = BlockRef> + '_ {
    let first = (self.heap.size() > 0).then_some(BlockRef::at(0));

    iter::successors(first, |&block| self.heap.next_header_of(block))
  }

  /// Checks every structural invariant of the heap: blocks tile the committed
  /// range, boundary tags agree, no two free blocks touch, and the free and
  /// allocated lists are address ordered and hold exactly the blocks in their
  /// state.
  pub fn verify(&self) -> Result<(), HeapViolation> {
    let base = self.heap.start().as_ptr() as usize;
    let heap_size = self.heap.size();
    let address = |block: BlockRef| base + block.offset();

    if heap_size % self.heap.page_size() != 0 || heap_size > self.heap.max_size() {
      return Err(HeapViolation::HeapSize {
        heap_size,
        heap_max_size: self.heap.max_size(),
        page_size: self.heap.page_size(),
      });
    }

    let mut free = Vec::new();
    let mut allocated = Vec::new();
    let mut counted = 0;
    let mut offset = 0;
    let mut previous_free = false;

    while offset < heap_size {
      let block = BlockRef::at(offset);

      if offset + HEADER_SIZE + FOOTER_SIZE > heap_size {
        return Err(HeapViolation::Overrun { address: address(block) });
      }

      let size = self.heap.size_of(block);
      let end = offset
        .checked_add(BLOCK_OVERHEAD)
        .and_then(|end| end.checked_add(size))
        .filter(|&end| end <= heap_size)
        .ok_or(HeapViolation::Overrun { address: address(block) })?;

      let footer = self.heap.footer_size(block);
      if footer != size {
        return Err(HeapViolation::TagMismatch {
          address: address(block),
          header: size,
          footer,
        });
      }

      let is_free = match self.heap.free_flag(block) {
        0 => false,
        1 => true,
        flag => return Err(HeapViolation::BadFlag { address: address(block), flag }),
      };

      if is_free && previous_free {
        let below = self.heap.previous_header_of(block).unwrap_or(block);
        return Err(HeapViolation::AdjacentFree { address: address(below) });
      }

      let blocks = if is_free { &mut free } else { &mut allocated };
      blocks.push(block);

      previous_free = is_free;
      counted += BLOCK_OVERHEAD + size;
      offset = end;
    }

    if counted != heap_size {
      return Err(HeapViolation::Accounting { counted, heap_size });
    }

    self.verify_list(ListKind::Free, self.blocks.free, &free)?;
    self.verify_list(ListKind::Allocated, self.blocks.allocated, &allocated)
  }

  /// `expected` is the set of blocks in the list's state, in address order,
  /// as found by walking the heap.
  fn verify_list(
    &self,
    kind: ListKind,
    list: BlockList,
    expected: &[BlockRef],
  ) -> Result<(), HeapViolation> {
    let base = self.heap.start().as_ptr() as usize;

    if list.first != expected.first().copied() || list.last != expected.last().copied() {
      return Err(HeapViolation::Endpoint { list: kind });
    }

    let mut current = list.first;
    let mut previous: Option<BlockRef> = None;

    for &block in expected {
      let Some(node) = current else {
        return Err(HeapViolation::Membership { list: kind, address: base + block.offset() });
      };

      // Stop before following links out of a node that is not a real block.
      if node != block {
        let address = base + node.offset();

        return Err(match previous {
          Some(previous) if node <= previous => HeapViolation::Unordered { list: kind, address },
          _ => HeapViolation::Membership { list: kind, address },
        });
      }

      previous = Some(node);
      current = self.heap.next_of(node);
    }

    match current {
      Some(extra) => Err(HeapViolation::Membership { list: kind, address: base + extra.offset() }),
      None => Ok(()),
    }
  }
}
