//! Thin wrappers over the libc calls the allocator needs. None of these allocate.

use core::ptr::null_mut;

pub unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(test)]
pub unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

pub fn page_size() -> usize {
  let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if ps <= 0 { 4096 } else { ps as usize }
}

/// Online CPUs as reported by the OS. `std::thread::available_parallelism` is not
/// usable here: it may read cgroup files into heap buffers.
pub fn cpu_count() -> usize {
  let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if n <= 0 { 1 } else { n as usize }
}

pub fn yield_now() {
  unsafe { libc::sched_yield() };
}

/// Best-effort write of `bytes` to stderr. Short writes are retried, errors dropped.
pub fn write_stderr(mut bytes: &[u8]) {
  while !bytes.is_empty() {
    let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
    if n <= 0 {
      return;
    }
    bytes = &bytes[n as usize..];
  }
}

/// Aborts the process after printing `msg`. Used only when the allocator cannot
/// provide any service at all.
pub fn fatal(msg: &str) -> ! {
  write_stderr(b"smalloc: fatal: ");
  write_stderr(msg.as_bytes());
  write_stderr(b"\n");
  unsafe { libc::abort() }
}
