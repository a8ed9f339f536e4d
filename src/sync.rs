//! Spin mutex guarding each arena.
//!
//! `std::sync::Mutex` would do, but a spin lock keeps the arena table
//! const-constructible and never touches the allocator.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

use crate::os;

/// Busy-wait rounds before yielding the CPU to the lock holder.
const SPINS_BEFORE_YIELD: u32 = 64;

pub struct SpinMutex<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinGuard<'_, T> {
    let mut spins = 0u32;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          os::yield_now();
        }
      }
    }
    SpinGuard { mutex: self }
  }

  #[cfg(test)]
  pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| SpinGuard { mutex: self })
  }
}

pub struct SpinGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.mutex.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.mutex.locked.store(false, Ordering::Release);
  }
}
