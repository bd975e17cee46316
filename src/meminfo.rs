/// Physical memory figures for sizing a reservation. The allocator itself
/// never looks at these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
  pub total_physical: usize,
  pub available_physical: usize,
  pub page_size: usize,
}

impl MemoryInfo {
  #[cfg(all(unix, not(miri)))]
  pub fn query() -> Self {
    let page_size = crate::platform::page_size();
    let total_physical = pages_to_bytes(unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) }, page_size);

    Self {
      total_physical,
      available_physical: available_physical(page_size).unwrap_or(total_physical),
      page_size,
    }
  }

  /// Miri cannot call `sysconf`, so pretend to be a small machine.
  #[cfg(miri)]
  pub fn query() -> Self {
    let page_size = crate::platform::page_size();

    Self {
      total_physical: 1 << 30,
      available_physical: 1 << 29,
      page_size,
    }
  }
}

#[cfg(all(unix, not(miri)))]
fn pages_to_bytes(
  pages: libc::c_long,
  page_size: usize,
) -> usize {
  usize::try_from(pages).unwrap_or(0).saturating_mul(page_size)
}

#[cfg(all(any(target_os = "linux", target_os = "android"), not(miri)))]
fn available_physical(page_size: usize) -> Option<usize> {
  let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

  (pages > 0).then(|| pages_to_bytes(pages, page_size))
}

/// Only Linux exposes available pages through `sysconf`.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android")), not(miri)))]
fn available_physical(_page_size: usize) -> Option<usize> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_query() {
    let info = MemoryInfo::query();

    assert_eq!(info.page_size, crate::platform::page_size());
    assert!(info.total_physical > 0);
    assert_eq!(info.total_physical % info.page_size, 0);
    assert!(info.available_physical <= info.total_physical);
  }
}
