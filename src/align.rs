/// Rounds the given size up to the machine word alignment. Every payload the
/// allocator hands out is a multiple of this.
///
/// # Examples
///
/// ```rust
/// use std::mem;
/// use tagalloc::align;
///
/// match mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    ($value + ::core::mem::size_of::<usize>() - 1) & !(::core::mem::size_of::<usize>() - 1)
  };
}

/// Same as [`align!`] but returns `None` instead of wrapping around when
/// `value` is close to `usize::MAX`.
#[inline]
pub fn checked_word_align(value: usize) -> Option<usize> {
  value.checked_next_multiple_of(crate::block::WORD_SIZE)
}

/// Rounds `value` up to the next multiple of `page_size`. Commits are always
/// page granular, so this decides how much the heap grows by.
#[inline]
pub fn page_align(
  value: usize,
  page_size: usize,
) -> Option<usize> {
  value.checked_next_multiple_of(page_size)
}
