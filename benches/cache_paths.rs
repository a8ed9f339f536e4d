use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use smalloc::{Options, Registry};
use std::{hint::black_box, thread};

const OPS: u64 = 100_000;

static CACHED: Registry = Registry::new(Options { thread_cache: true, ..Options::DEFAULT });
static UNCACHED: Registry = Registry::new(Options { thread_cache: false, ..Options::DEFAULT });

fn churn(reg: &'static Registry, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = reg.allocate(size);
      black_box(ptr);
      reg.deallocate(ptr);
    }
  }
}

/// Every thread allocates, then hands its blocks to the next thread to free.
fn remote_free(reg: &'static Registry, threads: usize, size: usize) {
  let per_thread = (OPS as usize) / threads;
  let blocks: Vec<Vec<usize>> = thread::scope(|s| {
    let handles: Vec<_> = (0..threads)
      .map(|_| {
        s.spawn(move || (0..per_thread).map(|_| reg.allocate(size) as usize).collect::<Vec<_>>())
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });
  thread::scope(|s| {
    for batch in blocks.iter().cycle().skip(1).take(threads) {
      s.spawn(move || {
        for &p in batch {
          unsafe { reg.deallocate(p as *mut u8) };
        }
      });
    }
  });
}

fn benchmark_cache_paths(c: &mut Criterion) {
  let mut group = c.benchmark_group("cache_paths");

  for size in [32, 256, 1000] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tcache", size), &size, |b, &size| {
      b.iter(|| churn(&CACHED, size))
    });

    group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
      b.iter(|| churn(&UNCACHED, size))
    });
  }

  group.finish();
}

fn benchmark_remote_free(c: &mut Criterion) {
  let mut group = c.benchmark_group("remote_free");
  group.sample_size(20);

  for threads in [2, 4, 8] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("tcache", threads), &threads, |b, &threads| {
      b.iter(|| remote_free(&CACHED, threads, 128))
    });

    group.bench_with_input(BenchmarkId::new("arena", threads), &threads, |b, &threads| {
      b.iter(|| remote_free(&UNCACHED, threads, 128))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_cache_paths, benchmark_remote_free);
criterion_main!(benches);
