use gpu_fifo::alloc::{AllocatorOptions, BuddyAllocator, VaFlags, VaSpace};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("============================================================");
    println!("                GPU FIFO - Buddy Allocator Demo             ");
    println!("============================================================");

    // 1. A plain ID/offset allocator
    let ids = BuddyAllocator::new("ids", 0, 1024, 16, None, AllocatorOptions::default())?;
    let a = ids.allocate(100)?;
    let b = ids.allocate(50)?;
    let fixed = ids.allocate_fixed(512, 192)?;
    println!("[+] allocate(100) -> 0x{a:x}, allocate(50) -> 0x{b:x}, fixed -> 0x{fixed:x}");
    println!("\n{}", ids.stats());

    ids.free(a);
    ids.free(b);
    ids.free(fixed);
    println!("[+] After freeing everything:\n\n{}", ids.stats());
    ids.destroy();

    // 2. A GPU virtual address space with a kernel-reserved tail
    const SMALL: u64 = 4 << 10;
    const BIG: u64 = 64 << 10;
    let vm = VaSpace::new(1, 1 << 32, 1 << 32, 1 << 28, SMALL, BIG)?;

    let user = vm.reserve(3 * SMALL, VaFlags::new())?;
    let big = vm.reserve(2 * BIG, VaFlags::new().big_pages())?;
    let kernel = vm.reserve(SMALL, VaFlags::new().kernel())?;
    for r in [&user, &big, &kernel] {
        println!(
            "[+] reserved 0x{:x} + 0x{:x} (page 0x{:x}, kernel {})",
            r.addr, r.len, r.page_size, r.kernel
        );
    }
    println!("\n{}", vm.stats(false));

    vm.release(&user);
    vm.release(&big);
    vm.release(&kernel);
    vm.destroy();

    Ok(())
}
