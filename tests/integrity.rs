//! Misuse of the heap must abort the process with a message, not corrupt it.
//!
//! Each test re-runs itself in a child process, which is expected to die.

use std::env;
use std::process::Command;

use zonealloc::{Heap, LocalCache, Options, ToyStore};

use test_log::test;

const CHILD: &str = "ZONEALLOC_ABORT_CHILD";

fn in_child(test: &str) -> bool {
    env::var(CHILD).map_or(false, |name| name == test)
}

fn assert_aborts(test: &str, message: &str) {
    let out = Command::new(env::current_exe().unwrap())
        .args(&["--exact", test, "--nocapture", "--test-threads=1"])
        .env(CHILD, test)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr);
    log::info!("{} exited with {:?}: {}", test, out.status, stderr);
    assert!(!out.status.success(), "{} did not abort", test);
    assert!(
        stderr.contains("zonealloc: ") && stderr.contains(message),
        "{}: {}",
        test,
        stderr
    );
}

fn uncached_heap() -> Heap<ToyStore> {
    Heap::new(ToyStore::default(), Options::DEFAULT.thread_cache(false))
}

#[cfg(feature = "integrity")]
#[test]
fn test_double_free_aborts() {
    if !in_child("test_double_free_aborts") {
        return assert_aborts("test_double_free_aborts", "double free");
    }
    let heap = uncached_heap();
    // Keeps the zone alive across the first free.
    let _keep = heap.allocate(64).unwrap();
    let p = heap.allocate(64).unwrap();
    unsafe {
        heap.deallocate(p.as_ptr());
        heap.deallocate(p.as_ptr());
    }
}

#[cfg(feature = "integrity")]
#[test]
fn test_cached_double_free_aborts() {
    if !in_child("test_cached_double_free_aborts") {
        return assert_aborts("test_cached_double_free_aborts", "double free");
    }
    let heap = Heap::new(ToyStore::default(), Options::DEFAULT);
    let mut cache = LocalCache::new(&heap);
    let _keep = cache.allocate(64).unwrap();
    let p = cache.allocate(64).unwrap();
    unsafe {
        cache.deallocate(p.as_ptr());
        cache.deallocate(p.as_ptr());
    }
}

#[test]
fn test_foreign_free_aborts() {
    if !in_child("test_foreign_free_aborts") {
        return assert_aborts("test_foreign_free_aborts", "heap");
    }
    let one = uncached_heap();
    let two = uncached_heap();
    let _mine = two.allocate(64).unwrap();
    let theirs = one.allocate(64).unwrap();
    unsafe { two.deallocate(theirs.as_ptr()) };
}

#[test]
fn test_interior_pointer_aborts() {
    if !in_child("test_interior_pointer_aborts") {
        return assert_aborts("test_interior_pointer_aborts", "not a chunk");
    }
    let heap = uncached_heap();
    let p = heap.allocate(64).unwrap();
    unsafe { heap.deallocate(p.as_ptr().add(8)) };
}

#[test]
fn test_stack_pointer_aborts() {
    if !in_child("test_stack_pointer_aborts") {
        return assert_aborts("test_stack_pointer_aborts", "not allocated by this heap");
    }
    let heap = uncached_heap();
    let _p = heap.allocate(64).unwrap();
    let mut local = 0u64;
    unsafe { heap.deallocate(&mut local as *mut u64 as *mut u8) };
}
