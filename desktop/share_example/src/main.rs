use std::sync::Arc;

use ion_heap::{
    modules::{
        heap::{ContiguousHeapModule, SystemHeapModule},
        migration::NoopMigrationModule,
        reclaim::NoopReclaimModule,
    },
    AllocationFlags, ContiguousAreas, ContiguousConfig, Device, HeapFlags, HeapId, IonConfig, ReservedMemory, Session,
    PAGE_SIZE,
};

const SYSTEM_HEAP: HeapId = HeapId(0);
const CONTIG_HEAP: HeapId = HeapId(4);

fn main() {
    env_logger::init();

    // stands in for memory the firmware kept away from the system
    let memory = ReservedMemory::reserve(256 * PAGE_SIZE, 256 * PAGE_SIZE).unwrap();
    let areas = Arc::new(ContiguousAreas::new(
        ContiguousConfig {
            min_alignment_order: 8,
            ..ContiguousConfig::default()
        },
        Arc::new(NoopMigrationModule),
        Arc::new(NoopReclaimModule),
    ));
    let region = areas.declare_reserved(&memory, 0).unwrap();
    areas.activate_all().unwrap();

    let device = Device::new(IonConfig::default());
    device
        .add_heap(
            SYSTEM_HEAP,
            Arc::new(SystemHeapModule::new("system").with_flags(HeapFlags::DEFER_FREE)),
        )
        .unwrap();
    device
        .add_heap(
            CONTIG_HEAP,
            Arc::new(ContiguousHeapModule::new("contig", region.clone()).with_areas(areas.clone(), 64)),
        )
        .unwrap();

    let producer = Session::open(&device).unwrap();
    let consumer = Session::open(&device).unwrap();

    {
        // a camera frame, any heap will do
        let frame = producer
            .alloc(
                16 * PAGE_SIZE,
                0,
                SYSTEM_HEAP.mask() | CONTIG_HEAP.mask(),
                AllocationFlags::CACHED,
            )
            .unwrap();
        let (phys, len) = producer.client().phys(frame).unwrap();
        println!("frame: {} bytes at {:#x}", len, phys);

        let descriptor = producer.share(frame).unwrap();
        let imported = consumer.import(descriptor).unwrap();

        // the consumer writes through a user mapping, then hands it to a device
        let mapping = device.descriptor(descriptor).unwrap().mmap(16).unwrap();
        mapping.fault(0).unwrap();
        mapping.fault(7).unwrap();
        println!(
            "dirty pages before sync: {}",
            consumer.client().buffer(imported).unwrap().dirty_pages()
        );
        consumer.sync(descriptor).unwrap();
        drop(mapping);

        producer.free(frame).unwrap();
        device.close_descriptor(descriptor).unwrap();
        let id = consumer.client().buffer(imported).unwrap().id();
        println!("frame still referenced {} times", device.buffer_ref_count(id).unwrap());
        consumer.free(imported).unwrap();
    }

    {
        // the contiguous heap is full, the walk falls back to the system heap
        let big = producer
            .alloc(
                512 * PAGE_SIZE,
                0,
                SYSTEM_HEAP.mask() | CONTIG_HEAP.mask(),
                AllocationFlags::empty(),
            )
            .unwrap();
        let buffer = producer.client().buffer(big).unwrap();
        println!("{} bytes from heap {}", buffer.size(), buffer.heap_name());
        drop(buffer);
        producer.free(big).unwrap();
    }

    println!(
        "{} contiguous pages in use, {} buffers alive",
        areas.usage_pages(),
        device.buffer_count()
    );
}
