use std::{mem, ptr::NonNull};

use crate::{align, error::AllocError, platform};

/// One contiguous range of reserved address space. Only the first
/// [`HeapReservation::size`] bytes are accessible, and they only ever grow, one
/// whole number of pages at a time.
///
/// ```text
///   heap_start                      heap_start + size        heap_start + max_size
///   |                                      |                                    |
///   v                                      v                                    v
///   +--------------------------------------+------------------------------------+
///   |      committed (read / write)        |      reserved (no access)          |
///   +--------------------------------------+------------------------------------+
/// ```
///
/// Everything inside the committed prefix is addressed by byte offset from
/// `heap_start`; [`crate::block::BlockRef`] is built on top of that.
pub(crate) struct HeapReservation {
  start: NonNull<u8>,
  size: usize,
  max_size: usize,
  page_size: usize,
}

impl HeapReservation {
  /// Reserves `max_size` bytes. Nothing is committed yet.
  pub fn new(max_size: usize) -> Result<Self, AllocError> {
    let page_size = platform::page_size();

    let Some(start) = (unsafe { platform::reserve(max_size) }) else {
      return Err(AllocError::Reserve { size: max_size });
    };

    Ok(Self {
      start,
      size: 0,
      max_size,
      page_size,
    })
  }

  #[inline]
  pub fn start(&self) -> NonNull<u8> {
    self.start
  }

  /// Committed bytes.
  #[inline]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn max_size(&self) -> usize {
    self.max_size
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Commits at least `length` more bytes right after the current end and
  /// returns how many were actually committed (a whole number of pages). The
  /// new bytes start at the old [`Self::size`] offset.
  ///
  /// Fails without touching anything if the rounded length would not fit in
  /// the reservation or the OS refuses the commit.
  pub fn grow(
    &mut self,
    length: usize,
  ) -> Result<usize, AllocError> {
    let out_of_memory = AllocError::OutOfMemory { requested: length };

    let committed = align::page_align(length, self.page_size).ok_or(out_of_memory)?;
    let new_size = self.size.checked_add(committed).ok_or(out_of_memory)?;

    if new_size > self.max_size {
      return Err(out_of_memory);
    }

    // SAFETY: `self.size` is page aligned and `new_size <= max_size`, so the
    // range lies inside the reservation.
    let heap_end = unsafe { NonNull::new_unchecked(self.start.as_ptr().add(self.size)) };

    if !unsafe { platform::commit(heap_end, committed) } {
      return Err(out_of_memory);
    }

    self.size = new_size;

    Ok(committed)
  }

  /// Absolute address of the byte at `offset`.
  #[inline]
  pub fn address_of(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    debug_assert!(offset <= self.size);
    // SAFETY: offsets never exceed the committed size, which never exceeds the
    // reservation.
    unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
  }

  /// Offset of `address` from the heap start. `address` must point into the
  /// committed range.
  #[inline]
  pub fn offset_of(
    &self,
    address: NonNull<u8>,
  ) -> usize {
    let offset = (address.as_ptr() as usize).wrapping_sub(self.start.as_ptr() as usize);
    debug_assert!(offset < self.size, "pointer {address:?} is not inside this heap");

    offset
  }

  /// Reads the machine word stored at `offset`.
  #[inline]
  pub fn read_word(
    &self,
    offset: usize,
  ) -> usize {
    debug_assert!(offset % mem::size_of::<usize>() == 0);
    debug_assert!(offset + mem::size_of::<usize>() <= self.size);
    // SAFETY: block metadata offsets are word aligned and inside the
    // committed prefix, which is readable and writable.
    unsafe { self.start.as_ptr().add(offset).cast::<usize>().read() }
  }

  /// Writes a machine word at `offset`.
  #[inline]
  pub fn write_word(
    &mut self,
    offset: usize,
    value: usize,
  ) {
    debug_assert!(offset % mem::size_of::<usize>() == 0);
    debug_assert!(offset + mem::size_of::<usize>() <= self.size);
    // SAFETY: see `read_word`.
    unsafe { self.start.as_ptr().add(offset).cast::<usize>().write(value) }
  }
}

impl Drop for HeapReservation {
  fn drop(&mut self) {
    unsafe { platform::release(self.start, self.max_size) };
  }
}
