use std::iter;

use crate::{block::BlockRef, reservation::HeapReservation};

/// Intrusive singly linked list of blocks. The links are the `next` fields of
/// the block headers themselves, this struct only caches both ends. Nodes are
/// kept in ascending address order, which is what makes it possible to find a
/// node's list predecessor by walking the heap backwards instead of walking
/// the list forwards.
///
/// ```text
///            first                              last
///              |                                  |
///              v                                  v
///   +-------+-----+-------+-----+-------+-----+-------+
///   | Alloc |  F  | Alloc |  F  | Alloc |  F  | Alloc |
///   +-------+-----+-------+-----+-------+-----+-------+
///              |             ^  |             ^
///              +-------------+  +-------------+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BlockList {
  pub first: Option<BlockRef>,
  pub last: Option<BlockRef>,
}

impl BlockList {
  pub const fn new() -> Self {
    Self {
      first: None,
      last: None,
    }
  }

  /// Links `block` right after `previous`, or at the head when `previous` is
  /// `None`. The caller picks `previous` so that address order holds.
  pub fn insert_after(
    &mut self,
    heap: &mut HeapReservation,
    previous: Option<BlockRef>,
    block: BlockRef,
  ) {
    let next = match previous {
      Some(previous) => heap.next_of(previous),
      None => self.first,
    };

    heap.set_next(block, next);

    match previous {
      Some(previous) => heap.set_next(previous, Some(block)),
      None => self.first = Some(block),
    }

    if next.is_none() {
      self.last = Some(block);
    }
  }

  /// Unlinks `block`. `previous` must be its list predecessor.
  pub fn remove_after(
    &mut self,
    heap: &mut HeapReservation,
    previous: Option<BlockRef>,
    block: BlockRef,
  ) {
    let next = heap.next_of(block);

    match previous {
      Some(previous) => heap.set_next(previous, next),
      None => self.first = next,
    }

    if self.last == Some(block) {
      self.last = previous;
    }
  }

  /// Puts `replacement` in the list slot occupied by `block`. Used when a
  /// split leaves a free remainder above the allocated part: the remainder is
  /// the only new block and it sits where the old one did.
  pub fn replace(
    &mut self,
    heap: &mut HeapReservation,
    previous: Option<BlockRef>,
    block: BlockRef,
    replacement: BlockRef,
  ) {
    let next = heap.next_of(block);
    heap.set_next(replacement, next);

    match previous {
      Some(previous) => heap.set_next(previous, Some(replacement)),
      None => self.first = Some(replacement),
    }

    if self.last == Some(block) {
      self.last = Some(replacement);
    }
  }

  /// Walks the list in link order.
  pub fn iter<'h>(
    self,
    heap: &'h HeapReservation,
  ) -> impl Iterator<Item = BlockRef> + 'h {
    iter::successors(self.first, move |&block| heap.next_of(block))
  }
}

/// Both lists. Together they hold every block in the heap exactly once.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BlockDirectory {
  pub free: BlockList,
  pub allocated: BlockList,
}

impl BlockDirectory {
  pub const fn new() -> Self {
    Self {
      free: BlockList::new(),
      allocated: BlockList::new(),
    }
  }
}

/// Closest block below `block` that is allocated. Since the allocated list is
/// address ordered this is also `block`'s predecessor on that list.
pub(crate) fn nearest_preceding_allocated(
  heap: &HeapReservation,
  block: BlockRef,
) -> Option<BlockRef> {
  nearest_preceding(heap, block, false)
}

/// Closest block below `block` that is free. Same idea as
/// [`nearest_preceding_allocated`] for the free list. There is no bound on how
/// many allocated blocks this walks over.
pub(crate) fn nearest_preceding_free(
  heap: &HeapReservation,
  block: BlockRef,
) -> Option<BlockRef> {
  nearest_preceding(heap, block, true)
}

fn nearest_preceding(
  heap: &HeapReservation,
  block: BlockRef,
  is_free: bool,
) -> Option<BlockRef> {
  iter::successors(heap.previous_header_of(block), |&current| {
    heap.previous_header_of(current)
  })
  .find(|&current| heap.is_free(current) == is_free)
}
