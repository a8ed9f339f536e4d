//! Alignment helpers shared by the chunk protocol and the heap.

/// Alignment of every payload and every chunk size.
pub const ALIGNMENT: usize = 16;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Overflow-checked `align_up`.
#[inline(always)]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}

#[inline(always)]
pub const fn align16(x: usize) -> usize {
  align_up(x, ALIGNMENT)
}

#[inline(always)]
pub fn is_aligned16<T>(p: *const T) -> bool {
  (p as usize) & (ALIGNMENT - 1) == 0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align16_rounds_up_to_next_multiple() {
    assert_eq!(align16(0), 0);
    assert_eq!(align16(1), 16);
    assert_eq!(align16(16), 16);
    assert_eq!(align16(17), 32);
    assert_eq!(align16(40), 48);
  }

  #[test]
  fn checked_align_up_reports_overflow() {
    assert_eq!(checked_align_up(usize::MAX, 16), None);
    assert_eq!(checked_align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
    assert_eq!(checked_align_up(4097, 4096), Some(8192));
  }
}
