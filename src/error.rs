use std::{error, fmt};

/// Failures the allocator reports to its caller. Contract violations such as
/// double frees are not represented here, they are undefined behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// The OS refused to reserve `size` bytes of address space.
  Reserve { size: usize },
  /// The heap could not grow enough to fit `requested` payload bytes, either
  /// because the commit was rejected or because it would exceed the
  /// reservation. The heap is left untouched.
  OutOfMemory { requested: usize },
}

impl fmt::Display for AllocError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::Reserve { size } => write!(f, "failed to reserve {size} bytes of address space"),
      Self::OutOfMemory { requested } => write!(f, "out of memory allocating {requested} bytes"),
    }
  }
}

impl error::Error for AllocError {}

/// Which intrusive list a [`HeapViolation`] was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
  Free,
  Allocated,
}

impl fmt::Display for ListKind {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::Free => f.write_str("free"),
      Self::Allocated => f.write_str("allocated"),
    }
  }
}

/// A broken structural invariant found by [`crate::Allocator::verify`].
/// Addresses are absolute block header addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapViolation {
  /// `heap_size` is not a multiple of the page size or exceeds the
  /// reservation.
  HeapSize { heap_size: usize, heap_max_size: usize, page_size: usize },
  /// Header and footer disagree on the payload size.
  TagMismatch { address: usize, header: usize, footer: usize },
  /// A block runs past the committed end of the heap.
  Overrun { address: usize },
  /// The free flag holds something other than 0 or 1.
  BadFlag { address: usize, flag: usize },
  /// Two free blocks sit next to each other.
  AdjacentFree { address: usize },
  /// A list node is not strictly above the node before it.
  Unordered { list: ListKind, address: usize },
  /// A list links a block whose state does not match the list, or misses a
  /// block that should be on it.
  Membership { list: ListKind, address: usize },
  /// The cached first/last pointers of a list are wrong.
  Endpoint { list: ListKind },
  /// Payloads plus per-block overhead do not add up to `heap_size`.
  Accounting { counted: usize, heap_size: usize },
}

impl fmt::Display for HeapViolation {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::HeapSize { heap_size, heap_max_size, page_size } => write!(
        f,
        "heap size {heap_size} is not page aligned ({page_size}) or exceeds {heap_max_size}"
      ),
      Self::TagMismatch { address, header, footer } => write!(
        f,
        "block {address:#x}: header size {header} != footer size {footer}"
      ),
      Self::Overrun { address } => write!(f, "block {address:#x} runs past the heap end"),
      Self::BadFlag { address, flag } => write!(f, "block {address:#x}: invalid free flag {flag}"),
      Self::AdjacentFree { address } => {
        write!(f, "block {address:#x} is free and so is the block after it")
      }
      Self::Unordered { list, address } => {
        write!(f, "{list} list is not address ordered at {address:#x}")
      }
      Self::Membership { list, address } => {
        write!(f, "block {address:#x} is misplaced with respect to the {list} list")
      }
      Self::Endpoint { list } => write!(f, "{list} list endpoints are stale"),
      Self::Accounting { counted, heap_size } => write!(
        f,
        "blocks account for {counted} bytes but heap size is {heap_size}"
      ),
    }
  }
}

impl error::Error for HeapViolation {}
