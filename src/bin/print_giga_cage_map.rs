use partalloc::freeslot_bitmap::reserved_free_slot_bitmap_size;
use partalloc::{
    address_space, calculate_giga_cage_properties, super_page_payload_begin, super_page_payload_end, GigaCageConfig,
    PoolHandle, ALIGNMENT, BRP_POOL_HANDLE, NON_BRP_POOL_HANDLE, PARTITION_PAGE_SIZE, SMALLEST_USED_BUCKET,
    SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};

use bytesize::ByteSize;
use thousands::Separable;

fn conv(size: usize) -> String {
    ByteSize::b(size as u64).to_string_as(true) // binary units
}

fn convsum(size: usize) -> String {
    format!("{} ({}b)", conv(size), size.ilog2())
}

fn print_geometry() {
    println!("system page:    {:>12} ({})", SYSTEM_PAGE_SIZE.separate_with_commas(), conv(SYSTEM_PAGE_SIZE));
    println!("partition page: {:>12} ({})", PARTITION_PAGE_SIZE.separate_with_commas(), conv(PARTITION_PAGE_SIZE));
    println!("super page:     {:>12} ({})", SUPER_PAGE_SIZE.separate_with_commas(), conv(SUPER_PAGE_SIZE));
    println!("alignment: {ALIGNMENT}, smallest used bucket: {SMALLEST_USED_BUCKET}");

    // Offsets only, so any aligned address will do.
    let sp = SUPER_PAGE_SIZE;
    let payload = super_page_payload_end(sp) - super_page_payload_begin(sp);
    println!(
        "super page: metadata {}, free-slot bitmap {}, payload {} bytes, guard {}",
        conv(PARTITION_PAGE_SIZE),
        conv(reserved_free_slot_bitmap_size()),
        payload.separate_with_commas(),
        conv(PARTITION_PAGE_SIZE)
    );
}

fn print_planned_layout(config: &GigaCageConfig) {
    let properties = calculate_giga_cage_properties(&config.pool_sizes());
    println!(
        "reservation: {} bytes ({}), alignment {}, alignment offset {}",
        properties.size.separate_with_commas(),
        convsum(properties.size),
        conv(properties.alignment),
        conv(properties.alignment_offset)
    );

    println!("{:>14} {:>26} {:>20}", "pool", "size", "super pages");
    println!("{:>14} {:>26} {:>20}", "----", "----", "-----------");
    for (name, size) in [
        ("non-BRP", config.non_brp_pool_size),
        ("BRP", config.brp_pool_size),
        ("configurable", config.configurable_pool_size),
    ] {
        println!(
            "{:>14} {:>26} {:>20}",
            name,
            format!("{} ({})", size.separate_with_commas(), conv(size)),
            (size / SUPER_PAGE_SIZE).separate_with_commas()
        );
    }
    if config.reserve_card_table {
        println!("card table: first super page of the non-BRP pool");
    }
}

fn print_reserved_pools() {
    let space = address_space();
    space.init();

    println!("reserved at {:#x}", space.reserved_base_address());
    let pools: [(&str, PoolHandle); 2] = [("non-BRP", NON_BRP_POOL_HANDLE), ("BRP", BRP_POOL_HANDLE)];
    for (name, handle) in pools {
        let Some(info) = space.pool_info(handle) else {
            println!("{name:>14}: not initialized");
            continue;
        };
        println!(
            "{:>14}: handle {}, [{:#x}, {:#x}), {} used",
            name,
            info.handle,
            info.base,
            info.end(),
            conv(space.pool_manager().used_bytes(handle))
        );
    }
}

fn main() {
    let config = *address_space().config();

    print_geometry();
    println!();
    print_planned_layout(&config);
    println!();
    print_reserved_pools();
}
