use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::{Duration, Instant},
};

use crate::{
    client::HandleRefs,
    config::{ContiguousConfig, IonConfig},
    contiguous::ContiguousAreas,
    device::Device,
    error::IonError,
    modules::{
        heap::{test::TestHeapModule, ContiguousHeapModule},
        migration::NoopMigrationModule,
        reclaim::NoopReclaimModule,
    },
    session::Session,
    types::{AllocationFlags, HandleId, HeapFlags, HeapId, HeapType, TaskIdentity, PAGE_SIZE},
    util::ReservedMemory,
};

use super::{add_test_heap, get_test_device, get_test_device_with_config, init_logging, test_config, SYSTEM_HEAP};

#[test]
fn test_alloc_free_reclaims_immediately() {
    let (device, stats) = get_test_device();
    let client = device.create_client("test").unwrap();

    let handle = client
        .alloc(4096, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(handle, HandleId(1));

    let buffer_id = client.buffer(handle).unwrap().id();
    assert_eq!(client.buffer(handle).unwrap().size(), 4096);
    assert_eq!(device.buffer_ref_count(buffer_id), Some(1));
    assert_eq!(
        client.handle_refs(handle).unwrap(),
        HandleRefs {
            ref_count: 1,
            user_ref_count: 0,
            kmap_count: 0
        }
    );
    assert_eq!(stats.live(), 1);

    client.free(handle).unwrap();
    assert!(!device.contains_buffer(buffer_id));
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(stats.live(), 0);

    assert_eq!(client.free(handle), Err(IonError::InvalidHandle(handle)));
}

#[test]
fn test_lengths_are_page_rounded() {
    let (device, _stats) = get_test_device();
    let client = device.create_client("test").unwrap();

    let handle = client
        .alloc(PAGE_SIZE + 1, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let buffer = client.buffer(handle).unwrap();
    assert_eq!(buffer.size(), 2 * PAGE_SIZE);
    assert_eq!(buffer.segment_table().total_len(), 2 * PAGE_SIZE);

    // the table is addressed by physical addresses
    for segment in buffer.segment_table().segments() {
        assert_eq!(segment.dma_address, segment.phys);
    }
}

#[test]
fn test_handle_ids_are_dense() {
    let (device, _stats) = get_test_device();
    let client = device.create_client("test").unwrap();

    let handles: Vec<HandleId> = (0..4)
        .map(|_| {
            client
                .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
                .unwrap()
        })
        .collect();
    assert_eq!(handles, vec![HandleId(1), HandleId(2), HandleId(3), HandleId(4)]);

    client.free(HandleId(2)).unwrap();
    let reused = client
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(reused, HandleId(2));
    assert_eq!(client.handle_count(), 4);
}

#[test]
fn test_no_such_heap() {
    let (device, stats) = get_test_device();
    let client = device.create_client("test").unwrap();

    let mask = HeapId(5).mask();
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, mask, AllocationFlags::empty()),
        Err(IonError::NoSuchHeap { mask })
    );
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, 0, AllocationFlags::empty()),
        Err(IonError::NoSuchHeap { mask: 0 })
    );
    assert_eq!(stats.allocations(), 0);
    assert_eq!(client.handle_count(), 0);
}

#[test]
fn test_falls_back_to_lower_priority_heap() {
    init_logging();
    let device = Device::new(test_config());
    let low = add_test_heap(&device, HeapId(0), TestHeapModule::new("low"));
    let high = add_test_heap(&device, HeapId(2), TestHeapModule::new("high").with_limit(PAGE_SIZE));
    assert_eq!(device.heap_ids(), vec![HeapId(2), HeapId(0)]);

    let client = device.create_client("test").unwrap();
    let mask = HeapId(0).mask() | HeapId(2).mask();

    let first = client.alloc(PAGE_SIZE, 0, mask, AllocationFlags::empty()).unwrap();
    assert_eq!(client.buffer(first).unwrap().heap_id(), HeapId(2));
    assert_eq!(client.buffer(first).unwrap().heap_name(), "high");

    let second = client.alloc(PAGE_SIZE, 0, mask, AllocationFlags::empty()).unwrap();
    assert_eq!(client.buffer(second).unwrap().heap_id(), HeapId(0));

    assert_eq!(high.live(), 1);
    assert_eq!(low.live(), 1);

    low.fail_allocate.store(true, Ordering::Release);
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, mask, AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: PAGE_SIZE })
    );
}

#[test]
fn test_duplicate_heap_ids_are_rejected() {
    let (device, _stats) = get_test_device();
    device
        .add_heap(SYSTEM_HEAP, Arc::new(TestHeapModule::new("again")))
        .expect_err("heap id is taken");
    device
        .add_heap(HeapId(32), Arc::new(TestHeapModule::new("too high")))
        .expect_err("heap id does not fit into a mask");
    assert_eq!(device.heap_ids(), vec![SYSTEM_HEAP]);
}

#[test]
fn test_failed_dma_mapping_does_not_leak() {
    let (device, stats) = get_test_device();
    let client = device.create_client("test").unwrap();

    stats.fail_map_dma.store(true, Ordering::Release);
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: PAGE_SIZE })
    );
    assert_eq!(stats.allocations(), 1);
    assert_eq!(stats.frees(), 1);
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(client.handle_count(), 0);

    stats.fail_map_dma.store(false, Ordering::Release);
    let handle = client
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    client.free(handle).unwrap();
    assert_eq!(stats.allocations(), stats.frees());
}

#[test]
fn test_invalid_lengths() {
    let (device, stats) = get_test_device_with_config(IonConfig {
        max_allocation_size: Some(4 * PAGE_SIZE),
        ..test_config()
    });
    let client = device.create_client("test").unwrap();

    assert!(matches!(
        client.alloc(0, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.alloc(4 * PAGE_SIZE + 1, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.alloc(usize::MAX, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
    assert_eq!(stats.allocations(), 0);

    let handle = client
        .alloc(4 * PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    client.free(handle).unwrap();
}

#[test]
fn test_invalid_alignments() {
    let (device, stats) = get_test_device_with_config(IonConfig {
        max_allocation_size: Some(4 * PAGE_SIZE),
        ..test_config()
    });
    let client = device.create_client("test").unwrap();

    for align in [3, PAGE_SIZE + 1, usize::MAX, 8 * PAGE_SIZE, 1 << (usize::BITS - 1)] {
        assert!(
            matches!(
                client.alloc(PAGE_SIZE, align, SYSTEM_HEAP.mask(), AllocationFlags::empty()),
                Err(IonError::InvalidArgument(_))
            ),
            "alignment {:#x}",
            align
        );
    }
    assert_eq!(stats.allocations(), 0);

    for align in [1, PAGE_SIZE, 4 * PAGE_SIZE] {
        let handle = client
            .alloc(PAGE_SIZE, align, SYSTEM_HEAP.mask(), AllocationFlags::empty())
            .unwrap();
        client.free(handle).unwrap();
    }
}

#[test]
fn test_huge_alignment_on_contiguous_heap() {
    init_logging();
    let memory = ReservedMemory::reserve(16 * PAGE_SIZE, 16 * PAGE_SIZE).unwrap();
    let areas = ContiguousAreas::new(
        ContiguousConfig {
            min_alignment_order: 0,
            ..ContiguousConfig::default()
        },
        Arc::new(NoopMigrationModule),
        Arc::new(NoopReclaimModule),
    );
    let region = areas.declare_reserved(&memory, 0).unwrap();
    region.activate().unwrap();

    let contig = HeapId(2);
    let device = Device::new(IonConfig {
        max_allocation_size: None,
        ..test_config()
    });
    device
        .add_heap(contig, Arc::new(ContiguousHeapModule::new("contig", region.clone())))
        .unwrap();
    let session = Session::open(&device).unwrap();

    assert!(matches!(
        session.alloc(PAGE_SIZE, usize::MAX, contig.mask(), AllocationFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
    // a power of two the region cannot satisfy fails like any other request
    assert_eq!(
        session.alloc(PAGE_SIZE, 1 << (usize::BITS - 1), contig.mask(), AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: PAGE_SIZE })
    );
    assert_eq!(
        session.alloc(32 * PAGE_SIZE, 0, contig.mask(), AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: 32 * PAGE_SIZE })
    );
    assert_eq!(region.used_pages(), 0);

    // the heap list is still usable
    let handle = session
        .alloc(16 * PAGE_SIZE, 0, contig.mask(), AllocationFlags::empty())
        .unwrap();
    session.free(handle).unwrap();
    assert_eq!(region.used_pages(), 0);
}

#[test]
fn test_allocation_ceiling_can_be_disabled() {
    let (device, _stats) = get_test_device_with_config(IonConfig {
        max_allocation_size: None,
        ..test_config()
    });
    let client = device.create_client("test").unwrap();

    let len = 2 * 1024 * 1024;
    let handle = client
        .alloc(len, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(client.buffer(handle).unwrap().size(), len);
}

#[test]
fn test_deferred_free() {
    init_logging();
    let id = HeapId(3);
    let device = Device::new(test_config());
    let stats = add_test_heap(
        &device,
        id,
        TestHeapModule::new("deferred").with_flags(HeapFlags::DEFER_FREE),
    );
    let client = device.create_client("test").unwrap();

    let handle = client
        .alloc(2 * PAGE_SIZE, 0, id.mask(), AllocationFlags::empty())
        .unwrap();
    let buffer_id = client.buffer(handle).unwrap().id();
    client.free(handle).unwrap();

    // unreachable right away, but the memory is still owned by the list
    assert!(!device.contains_buffer(buffer_id));
    assert_eq!(device.deferred_size(id), Ok(2 * PAGE_SIZE));
    assert_eq!(device.deferred_buffers(id), Ok(1));
    assert_eq!(stats.frees(), 0);

    assert_eq!(device.drain_deferred(id), Ok(2 * PAGE_SIZE));
    assert_eq!(device.deferred_size(id), Ok(0));
    assert_eq!(stats.frees(), 1);

    assert_eq!(device.drain_deferred(SYSTEM_HEAP), Err(IonError::NoSuchHeap { mask: SYSTEM_HEAP.mask() }));
}

#[test]
fn test_deferred_heap_is_drained_before_retry() {
    init_logging();
    let id = HeapId(1);
    let device = Device::new(test_config());
    let stats = add_test_heap(
        &device,
        id,
        TestHeapModule::new("deferred")
            .with_flags(HeapFlags::DEFER_FREE)
            .with_limit(2 * PAGE_SIZE),
    );
    let client = device.create_client("test").unwrap();

    let handle = client
        .alloc(2 * PAGE_SIZE, 0, id.mask(), AllocationFlags::empty())
        .unwrap();
    client.free(handle).unwrap();
    assert_eq!(device.deferred_buffers(id), Ok(1));

    // the limit is only free again once the list is drained
    let handle = client
        .alloc(2 * PAGE_SIZE, 0, id.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(device.deferred_buffers(id), Ok(0));
    assert_eq!(stats.frees(), 1);
    assert_eq!(stats.live(), 1);
    client.free(handle).unwrap();
}

#[test]
fn test_deferred_heap_is_not_drained_for_rejected_requests() {
    init_logging();
    let id = HeapId(1);
    let device = Device::new(test_config());
    let stats = add_test_heap(
        &device,
        id,
        TestHeapModule::new("deferred").with_flags(HeapFlags::DEFER_FREE),
    );
    let client = device.create_client("test").unwrap();

    let handle = client
        .alloc(PAGE_SIZE, 0, id.mask(), AllocationFlags::empty())
        .unwrap();
    client.free(handle).unwrap();
    assert_eq!(device.deferred_buffers(id), Ok(1));

    // draining does not help with this error, the list is left alone
    stats.reject_allocate.store(true, Ordering::Release);
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, id.mask(), AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: PAGE_SIZE })
    );
    assert_eq!(device.deferred_buffers(id), Ok(1));
    assert_eq!(stats.frees(), 0);

    // running out of memory does drain it
    stats.reject_allocate.store(false, Ordering::Release);
    stats.fail_allocate.store(true, Ordering::Release);
    assert_eq!(
        client.alloc(PAGE_SIZE, 0, id.mask(), AllocationFlags::empty()),
        Err(IonError::ResourceExhausted { len: PAGE_SIZE })
    );
    assert_eq!(device.deferred_buffers(id), Ok(0));
    assert_eq!(stats.frees(), 1);
}

#[test]
fn test_shrink() {
    init_logging();
    let id = HeapId(1);
    let device = Device::new(test_config());
    let stats = add_test_heap(
        &device,
        id,
        TestHeapModule::new("deferred").with_flags(HeapFlags::DEFER_FREE),
    );
    let client = device.create_client("test").unwrap();

    for len in [PAGE_SIZE, 2 * PAGE_SIZE] {
        let handle = client.alloc(len, 0, id.mask(), AllocationFlags::empty()).unwrap();
        client.free(handle).unwrap();
    }

    // a scan of 0 only counts
    assert_eq!(device.shrink(id, 0), Ok(3));
    assert_eq!(stats.frees(), 0);

    assert_eq!(device.shrink(id, 1), Ok(1));
    assert_eq!(device.shrink(id, 0), Ok(2));

    // the list cannot free enough, the heap is asked for the rest
    let shrinks = stats.shrinks.load(Ordering::Acquire);
    assert_eq!(device.shrink(id, 5), Ok(2));
    assert_eq!(stats.shrinks.load(Ordering::Acquire), shrinks + 1);
    assert_eq!(stats.frees(), 2);
    assert_eq!(device.deferred_size(id), Ok(0));
}

#[test]
fn test_deferred_free_worker() {
    init_logging();
    let id = HeapId(1);
    let device = Device::new(IonConfig::default());
    let stats = add_test_heap(
        &device,
        id,
        TestHeapModule::new("worker").with_flags(HeapFlags::DEFER_FREE),
    );
    let client = device.create_client("test").unwrap();

    for _ in 0..8 {
        let handle = client
            .alloc(PAGE_SIZE, 0, id.mask(), AllocationFlags::empty())
            .unwrap();
        client.free(handle).unwrap();
    }

    let start = Instant::now();
    while stats.frees() < 8 {
        assert!(start.elapsed() < Duration::from_secs(5), "worker did not free the buffers");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(device.deferred_size(id), Ok(0));
}

#[test]
fn test_passthrough_heap() {
    init_logging();
    let id = HeapId(4);
    let device = Device::new(IonConfig {
        passthrough_heap_id: Some(id),
        ..test_config()
    });
    add_test_heap(
        &device,
        id,
        TestHeapModule::new("passthrough").with_heap_type(HeapType::VirtualPassthrough),
    );
    add_test_heap(&device, SYSTEM_HEAP, TestHeapModule::new("system"));
    let client = device.create_client("test").unwrap();

    let handle = client.alloc(100, 0, id.mask(), AllocationFlags::empty()).unwrap();
    let buffer = client.buffer(handle).unwrap();
    assert_eq!(buffer.size(), 100);
    // dma addresses stay whatever the heap produced
    assert!(buffer
        .segment_table()
        .segments()
        .iter()
        .all(|segment| segment.dma_address == 0));

    // only a mask of exactly this heap skips the rounding
    let handle = client
        .alloc(100, 0, id.mask() | SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(client.buffer(handle).unwrap().size(), PAGE_SIZE);
}

#[test]
fn test_client_names() {
    let (device, _stats) = get_test_device();

    let first = device.create_client("camera").unwrap();
    let second = device.create_client("camera").unwrap();
    let other = device.create_client("display").unwrap();
    assert_eq!(first.display_name(), "camera-0");
    assert_eq!(second.display_name(), "camera-1");
    assert_eq!(other.display_name(), "display-0");
    assert_eq!(first.name(), "camera");

    drop(first);
    let third = device.create_client("camera").unwrap();
    assert_eq!(third.display_name(), "camera-2");

    let mut names = device.client_names();
    names.sort();
    assert_eq!(names, vec!["camera-1", "camera-2", "display-0"]);

    let clients = device.clients();
    assert_eq!(clients.len(), 3);
    let listed = clients
        .iter()
        .find(|client| client.id == other.id())
        .expect("display client should be listed");
    assert_eq!(listed.display_name, "display-0");
    assert_eq!(listed.task, TaskIdentity::current());
    assert_eq!(&listed.task, other.task());

    assert!(matches!(device.create_client(""), Err(IonError::InvalidArgument(_))));
}

#[test]
fn test_allocating_client_is_recorded() {
    let (device, _stats) = get_test_device();
    let client = device.create_client("recorder").unwrap();
    let handle = client
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(client.buffer(handle).unwrap().alloc_client(), "recorder-0");
    assert!(client.handle_debug(handle).unwrap().user_ts > 0);
}
