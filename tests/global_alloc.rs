//! The process heap as the program's global allocator.

use std::collections::{BTreeMap, HashMap};
use std::thread;

use zonealloc::SlabAllocator;

use test_log::test;

#[global_allocator]
static ALLOCATOR: SlabAllocator = SlabAllocator::new();

#[repr(align(128))]
struct Aligned([u8; 300]);

fn workload(seed: usize) -> usize {
    let mut words: HashMap<String, usize> = HashMap::new();
    let mut order = BTreeMap::new();
    for i in 0..5000 {
        let key = format!("key-{}-{}", seed, (i * 7919) % 1000);
        *words.entry(key.clone()).or_insert(0) += i;
        order.insert(key, i);
    }

    let mut grown: Vec<u64> = Vec::new();
    for i in 0..50_000u64 {
        grown.push(i);
    }
    assert_eq!(grown.iter().sum::<u64>(), 50_000 * 49_999 / 2);
    grown.truncate(10);
    grown.shrink_to_fit();

    let boxes: Vec<Box<Aligned>> = (0..100).map(|_| Box::new(Aligned([7; 300]))).collect();
    for b in boxes.iter() {
        assert_eq!(&**b as *const Aligned as usize % 128, 0);
        assert!(b.0.iter().all(|&x| x == 7));
    }

    let big = vec![0u8; 1 << 20];
    assert!(big.iter().all(|&b| b == 0));

    words.len() + order.len() + grown.len()
}

#[test]
fn test_global_workload() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            thread::spawn(move || {
                let n = workload(t);
                zonealloc::thread_exit();
                n
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 2010);
    }
    assert_eq!(workload(99), 2010);

    let (validity, stats) = ALLOCATOR.stats();
    log::info!("{:?}", stats);
    assert!(validity.is_valid());
    assert!(stats.peak_mapped > 0);
}

#[test]
fn test_global_realloc_keeps_alignment() {
    let layout = std::alloc::Layout::from_size_align(100, 256).unwrap();
    unsafe {
        let p = std::alloc::alloc(layout);
        assert!(!p.is_null());
        p.write_bytes(0x5a, 100);
        let q = std::alloc::realloc(p, layout, 10_000);
        assert!(!q.is_null());
        assert_eq!(q as usize % 256, 0);
        assert!((0..100).all(|i| *q.add(i) == 0x5a));
        std::alloc::dealloc(q, std::alloc::Layout::from_size_align(10_000, 256).unwrap());
    }
}

#[test]
fn test_zero_sized_types() {
    let v: Vec<()> = vec![(); 100];
    assert_eq!(v.len(), 100);
    let empty: Vec<u32> = Vec::with_capacity(0);
    assert_eq!(empty.capacity(), 0);
    let b = Box::new([0u8; 0]);
    assert!(b.is_empty());
}
