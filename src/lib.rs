//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate provides a first-fit **malloc/free engine** that manages one
//! reserved range of virtual address space, with block reuse, splitting and
//! coalescing.
//!
//! ## Overview
//!
//! The whole heap is reserved up front with no access rights, so it costs no
//! physical memory. Pages are committed at the low end only when an
//! allocation does not fit anywhere:
//!
//! ```text
//!   Reservation:
//!
//!   heap_start                                                heap_start + max
//!   ┌──────────────────────────────────────┬────────────────────────────────┐
//!   │ ┌─────┬──────┬─────┬──────┬───────┐  │                                │
//!   │ │ A1  │ Free │ A2  │ A3   │ Free  │  │      reserved, not committed   │
//!   │ └─────┴──────┴─────┴──────┴───────┘  │                                │
//!   └──────────────────────────────────────┴────────────────────────────────┘
//!                                          ▲
//!                                          └── heap_start + heap_size
//!                                              (always a page multiple)
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align        - Word alignment macro (align!) and page rounding
//!   ├── allocator    - Allocator: alloc, free, growth
//!   ├── block        - On-heap header/footer layout, boundary tags
//!   ├── directory    - Address ordered free and allocated lists
//!   ├── dump         - Heap listing and invariant checks
//!   ├── error        - AllocError, HeapViolation
//!   ├── meminfo      - Physical memory query for sizing the heap
//!   ├── platform     - mmap / mprotect / munmap (internal)
//!   └── reservation  - The reserved range and its committed prefix (internal)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tagalloc::{Allocator, MB};
//!
//! fn main() {
//!     let mut allocator = Allocator::create(4 * MB).unwrap();
//!
//!     let ptr = allocator.alloc(64).unwrap().unwrap();
//!
//!     unsafe {
//!         ptr.as_ptr().write_bytes(0, 64);
//!         allocator.free(Some(ptr));
//!     }
//! }
//! ```
//!
//! ## How It Works
//!
//! Every block carries its size at both ends (boundary tags), and the header
//! also links it into one of two lists:
//!
//! ```text
//!   Single Block:
//!   ┌──────────────────┬───────────────────────────┬──────────────┐
//!   │     Header       │         Payload           │    Footer    │
//!   │ ┌──────────────┐ │                           │ ┌──────────┐ │
//!   │ │ size: N      │ │  ┌─────────────────────┐  │ │ size: N  │ │
//!   │ │ free: 0 / 1  │ │  │   N bytes usable    │  │ └──────────┘ │
//!   │ │ next: offset │ │  └─────────────────────┘  │              │
//!   │ └──────────────┘ │                           │              │
//!   │     3 words      │                           │    1 word    │
//!   └──────────────────┴───────────────────────────┴──────────────┘
//!                      ▲
//!                      └── Pointer returned to the user
//! ```
//!
//! - **alloc**: first fit over the free list; split when the remainder can
//!   hold a block of its own, otherwise hand out the whole block.
//! - **free**: merge with the free block below and/or above, so free blocks
//!   are never adjacent.
//! - **growth**: when nothing fits, commit more pages. A free block at the
//!   end of the heap is extended in place instead of starting a new one.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization, wrap it in a lock to share
//! - **Unix-only**: uses `mmap`/`mprotect` through `libc`
//! - **Word alignment only**: payloads are aligned to the pointer size
//! - **Never shrinks**: committed pages stay committed until the allocator is
//!   dropped
//!
//! ## Safety
//!
//! `free` trusts its argument. Freeing a pointer twice, freeing a pointer
//! this allocator did not hand out or writing past an allocation is undefined
//! behaviour, exactly like with the C allocator.

use std::ptr::NonNull;

pub mod align;
mod allocator;
mod block;
mod directory;
mod dump;
mod error;
mod meminfo;
mod platform;
mod reservation;

pub use allocator::Allocator;
pub use dump::{BlockInfo, BlockState};
pub use error::{AllocError, HeapViolation, ListKind};
pub use meminfo::MemoryInfo;

/// Nullable pointer. Allocations of zero bytes come back as `None`.
pub type Pointer<T> = Option<NonNull<T>>;

pub const KB: usize = 1024;
pub const MB: usize = KB * 1024;
pub const GB: usize = MB * 1024;
