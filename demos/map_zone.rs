//! This is a very minimal example to show using the BackingStore functions.

use zonealloc::{BackingStore, MmapStore, ZONE_SIZE};

fn main() {
    let store = MmapStore::new();
    println!("Page size: {}", store.page_size());

    // Zones are mapped aligned to their own size, so any pointer into one can
    // be masked back to its start.
    let p = unsafe { store.map(ZONE_SIZE, ZONE_SIZE).unwrap() };
    let addr = p.as_ptr() as usize;
    println!("Returned: ({:p}={}, {})", p, addr, ZONE_SIZE);
    assert_eq!(addr % ZONE_SIZE, 0);

    unsafe {
        let last = p.as_ptr().add(ZONE_SIZE - 1);
        last.write(42);
        println!("Masked: {:#x}", last as usize & !(ZONE_SIZE - 1));
        store.unmap(p, ZONE_SIZE);
    }
}
