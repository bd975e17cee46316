//! On-heap block layout. Blocks are never touched through Rust references:
//! every field lives at a fixed word offset from the block start and is read
//! or written through [`HeapReservation`], so the layout below is the literal
//! binary format regardless of how the compiler would lay out a struct.
//!
//! ```text
//!   BlockRef (offset from heap_start)
//!   |
//!   v
//!   +------------------+  <---+
//!   | size             |      |
//!   +------------------+      |
//!   | free (1 or 0)    |      | Header, HEADER_SIZE bytes.
//!   +------------------+      |
//!   | next (offset)    |      |
//!   +------------------+  <---+
//!   |                  |  <---+
//!   |     payload      |      | `size` bytes, a multiple of the word size.
//!   |                  |  <---+
//!   +------------------+  <---+
//!   | size             |      | Footer, FOOTER_SIZE bytes.
//!   +------------------+  <---+
//! ```
//!
//! `next` holds the offset of the next node of whichever list the block is on
//! (free or allocated), or [`NIL`] at the tail. The footer repeats `size` so
//! that the block below any given block can be found in O(1).

use std::mem;

use crate::reservation::HeapReservation;

pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

pub(crate) const HEADER_SIZE: usize = 3 * WORD_SIZE;

pub(crate) const FOOTER_SIZE: usize = WORD_SIZE;

/// Bytes a block costs on top of its payload.
pub(crate) const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest payload a split is allowed to leave behind.
pub(crate) const MIN_BLOCK_SIZE: usize = WORD_SIZE;

const SIZE_FIELD: usize = 0;
const FREE_FIELD: usize = WORD_SIZE;
const NEXT_FIELD: usize = 2 * WORD_SIZE;

/// Stored in the `next` field of list tails.
const NIL: usize = usize::MAX;

/// Offset of a block header from the heap start. Ordering block refs orders
/// blocks by address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockRef(usize);

impl BlockRef {
  #[inline]
  pub const fn at(offset: usize) -> Self {
    Self(offset)
  }

  #[inline]
  pub const fn offset(self) -> usize {
    self.0
  }

  /// Offset of the first payload byte.
  #[inline]
  pub const fn payload(self) -> usize {
    self.0 + HEADER_SIZE
  }

  /// Block owning the payload that starts at `offset`.
  #[inline]
  pub const fn from_payload(offset: usize) -> Self {
    Self(offset - HEADER_SIZE)
  }
}

/// Decoded copy of a block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
  pub size: usize,
  pub is_free: bool,
  pub next: Option<BlockRef>,
}

impl HeapReservation {
  pub fn block(
    &self,
    block: BlockRef,
  ) -> Block {
    Block {
      size: self.size_of(block),
      is_free: self.is_free(block),
      next: self.next_of(block),
    }
  }

  /// Writes a complete header and a matching footer at `block`.
  pub fn format(
    &mut self,
    block: BlockRef,
    size: usize,
    is_free: bool,
    next: Option<BlockRef>,
  ) {
    self.set_free(block, is_free);
    self.set_next(block, next);
    self.resize(block, size);
  }

  /// Payload size as recorded in the header.
  #[inline]
  pub fn size_of(
    &self,
    block: BlockRef,
  ) -> usize {
    self.read_word(block.offset() + SIZE_FIELD)
  }

  /// Updates both boundary tags. The footer moves with the size, so this is
  /// the only way sizes change once a block exists.
  #[inline]
  pub fn resize(
    &mut self,
    block: BlockRef,
    size: usize,
  ) {
    self.write_word(block.offset() + SIZE_FIELD, size);
    let footer = self.footer_of(block);
    self.write_word(footer, size);
  }

  /// Raw value of the free flag, for the verifier.
  #[inline]
  pub fn free_flag(
    &self,
    block: BlockRef,
  ) -> usize {
    self.read_word(block.offset() + FREE_FIELD)
  }

  #[inline]
  pub fn is_free(
    &self,
    block: BlockRef,
  ) -> bool {
    self.free_flag(block) != 0
  }

  #[inline]
  pub fn set_free(
    &mut self,
    block: BlockRef,
    is_free: bool,
  ) {
    self.write_word(block.offset() + FREE_FIELD, is_free as usize);
  }

  #[inline]
  pub fn next_of(
    &self,
    block: BlockRef,
  ) -> Option<BlockRef> {
    match self.read_word(block.offset() + NEXT_FIELD) {
      NIL => None,
      offset => Some(BlockRef::at(offset)),
    }
  }

  #[inline]
  pub fn set_next(
    &mut self,
    block: BlockRef,
    next: Option<BlockRef>,
  ) {
    self.write_word(block.offset() + NEXT_FIELD, next.map_or(NIL, BlockRef::offset));
  }

  /// Offset of the footer, derived from the header size.
  #[inline]
  pub fn footer_of(
    &self,
    block: BlockRef,
  ) -> usize {
    block.offset() + HEADER_SIZE + self.size_of(block)
  }

  /// Size as recorded in the footer.
  #[inline]
  pub fn footer_size(
    &self,
    block: BlockRef,
  ) -> usize {
    self.read_word(self.footer_of(block))
  }

  /// Offset one past the footer.
  #[inline]
  pub fn end_of(
    &self,
    block: BlockRef,
  ) -> usize {
    block.offset() + BLOCK_OVERHEAD + self.size_of(block)
  }

  /// Block right below `block`, found through the footer that precedes it.
  pub fn previous_header_of(
    &self,
    block: BlockRef,
  ) -> Option<BlockRef> {
    if block.offset() == 0 {
      return None;
    }

    let footer = block.offset() - FOOTER_SIZE;
    let size = self.read_word(footer);

    Some(BlockRef::at(footer - size - HEADER_SIZE))
  }

  /// Block right above `block`, `None` if `block` is the last one.
  pub fn next_header_of(
    &self,
    block: BlockRef,
  ) -> Option<BlockRef> {
    let next = self.end_of(block);

    (next != self.size()).then_some(BlockRef::at(next))
  }
}
