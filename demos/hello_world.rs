use zonealloc::SlabAllocator;

#[global_allocator]
static A: SlabAllocator = SlabAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);
}
