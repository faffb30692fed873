use std::sync::Arc;

use crate::{
    config::IonConfig,
    device::Device,
    modules::heap::test::{TestHeapModule, TestHeapStats},
    types::HeapId,
};

mod allocation;
mod sharing;

pub(crate) const SYSTEM_HEAP: HeapId = HeapId(0);

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deferred free lists are only drained explicitly, so tests see every
/// buffer on the list
pub(crate) fn test_config() -> IonConfig {
    IonConfig {
        deferred_free_worker: false,
        ..IonConfig::default()
    }
}

pub(crate) fn add_test_heap(device: &Device, id: HeapId, heap: TestHeapModule) -> Arc<TestHeapStats> {
    let stats = heap.stats.clone();
    device.add_heap(id, Arc::new(heap)).unwrap();
    stats
}

/// Device with a single system heap at [`SYSTEM_HEAP`]
pub(crate) fn get_test_device() -> (Arc<Device>, Arc<TestHeapStats>) {
    get_test_device_with_config(test_config())
}

pub(crate) fn get_test_device_with_config(config: IonConfig) -> (Arc<Device>, Arc<TestHeapStats>) {
    init_logging();
    let device = Device::new(config);
    let stats = add_test_heap(&device, SYSTEM_HEAP, TestHeapModule::new("system"));
    (device, stats)
}
