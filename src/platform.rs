use std::{ptr::NonNull, sync::OnceLock};

use crate::Pointer;

/// What the heap needs from the OS: a range of address space that costs
/// nothing until parts of it are made accessible, and the page size that
/// governs how those parts are handed out.
trait VirtualMemory {
  /// Reserves `length` bytes of address space with no access rights.
  unsafe fn reserve(length: usize) -> Pointer<u8>;

  /// Makes `length` bytes starting at `address` readable and writable.
  /// `address` must be page aligned and inside a reservation.
  unsafe fn commit(
    address: NonNull<u8>,
    length: usize,
  ) -> bool;

  /// Gives the whole reservation back.
  unsafe fn release(
    address: NonNull<u8>,
    length: usize,
  );

  fn page_size() -> usize;
}

/// Zero sized type implementing [`VirtualMemory`] for the current target.
struct Platform;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Virtual memory page size in bytes. Only known at runtime, so it is asked
/// for once and cached.
#[inline]
pub(crate) fn page_size() -> usize {
  *PAGE_SIZE.get_or_init(Platform::page_size)
}

#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
  unsafe { Platform::reserve(length) }
}

#[inline]
pub(crate) unsafe fn commit(
  address: NonNull<u8>,
  length: usize,
) -> bool {
  unsafe { Platform::commit(address, length) }
}

#[inline]
pub(crate) unsafe fn release(
  address: NonNull<u8>,
  length: usize,
) {
  unsafe { Platform::release(address, length) }
}

#[cfg(all(unix, not(miri)))]
mod unix {
  use std::ptr::{self, NonNull};

  use super::{Platform, VirtualMemory};
  use crate::Pointer;

  impl VirtualMemory for Platform {
    unsafe fn reserve(length: usize) -> Pointer<u8> {
      // No access and no swap reservation: touching these pages faults until
      // they are committed.
      let protection = libc::PROT_NONE;
      let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

      let address = unsafe { libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) };

      if address == libc::MAP_FAILED {
        None
      } else {
        NonNull::new(address.cast())
      }
    }

    unsafe fn commit(
      address: NonNull<u8>,
      length: usize,
    ) -> bool {
      let protection = libc::PROT_READ | libc::PROT_WRITE;

      unsafe { libc::mprotect(address.as_ptr().cast(), length, protection) == 0 }
    }

    unsafe fn release(
      address: NonNull<u8>,
      length: usize,
    ) {
      if unsafe { libc::munmap(address.as_ptr().cast(), length) } != 0 {
        log::warn!("munmap({:?}, {}) failed, reservation leaked", address, length);
      }
    }

    fn page_size() -> usize {
      page_size_or_default(unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) })
    }
  }

  const DEFAULT_PAGE_SIZE: usize = 4096;

  /// `sysconf` answers -1 when it cannot tell.
  fn page_size_or_default(value: libc::c_long) -> usize {
    usize::try_from(value)
      .ok()
      .filter(|size| size.is_power_of_two())
      .unwrap_or(DEFAULT_PAGE_SIZE)
  }

}

#[cfg(miri)]
mod miri {
  //! Miri has no FFI, so the reservation is a zeroed allocation from the
  //! global allocator and commits always succeed. Leaked reservations show up
  //! as Miri leak reports.

  use std::{alloc, ptr::NonNull};

  use super::{Platform, VirtualMemory};
  use crate::Pointer;

  const MIRI_PAGE_SIZE: usize = 4096;

  fn to_layout(length: usize) -> Option<alloc::Layout> {
    alloc::Layout::from_size_align(length, MIRI_PAGE_SIZE).ok()
  }

  impl VirtualMemory for Platform {
    unsafe fn reserve(length: usize) -> Pointer<u8> {
      if length == 0 {
        return None;
      }

      NonNull::new(unsafe { alloc::alloc_zeroed(to_layout(length)?) })
    }

    unsafe fn commit(
      _address: NonNull<u8>,
      _length: usize,
    ) -> bool {
      true
    }

    unsafe fn release(
      address: NonNull<u8>,
      length: usize,
    ) {
      if let Some(layout) = to_layout(length) {
        unsafe { alloc::dealloc(address.as_ptr(), layout) };
      }
    }

    fn page_size() -> usize {
      MIRI_PAGE_SIZE
    }
  }
}
