use std::{any::Any, collections::BTreeMap, sync::Arc};

use rand_xoshiro::{
    rand_core::{RngCore, SeedableRng},
    Xoshiro256PlusPlus,
};

use crate::{
    client::HandleRefs,
    config::IonConfig,
    error::IonError,
    modules::heap::test::TestHeapModule,
    session::Session,
    share::{ShareToken, SharedBuffer},
    types::{AllocationFlags, BufferId, Descriptor, DmaDirection, HandleId, HeapId, PAGE_SIZE},
};

use super::{add_test_heap, get_test_device, get_test_device_with_config, test_config, SYSTEM_HEAP};

/// Buffer of some other exporter
struct ForeignBuffer;

impl SharedBuffer for ForeignBuffer {
    fn size(&self) -> usize {
        PAGE_SIZE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn test_import_into_two_clients() {
    let (device, stats) = get_test_device();
    let owner = device.create_client("owner").unwrap();
    let first = device.create_client("first").unwrap();
    let second = device.create_client("second").unwrap();

    let handle = owner
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let buffer_id = owner.buffer(handle).unwrap().id();

    let token = owner.share(handle).unwrap();
    assert_eq!(token.size(), PAGE_SIZE);
    // all clones of a token hold the same single reference
    let clone = token.clone();
    assert_eq!(device.buffer_ref_count(buffer_id), Some(2));
    drop(clone);

    let first_handle = first.import_token(&token).unwrap();
    let second_handle = second.import_token(&token).unwrap();
    assert_eq!(first.buffer(first_handle).unwrap().id(), buffer_id);
    assert_eq!(second.buffer(second_handle).unwrap().id(), buffer_id);
    assert_eq!(first.handle_for_buffer(buffer_id), Some(first_handle));
    assert_eq!(owner.buffer(handle).unwrap().handle_count(), 3);

    drop(token);
    assert_eq!(device.buffer_ref_count(buffer_id), Some(3));

    owner.free(handle).unwrap();
    assert_eq!(device.buffer_ref_count(buffer_id), Some(2));
    first.free(first_handle).unwrap();
    assert!(device.contains_buffer(buffer_id));

    second.free(second_handle).unwrap();
    assert!(!device.contains_buffer(buffer_id));
    assert_eq!(stats.live(), 0);
}

#[test]
fn test_import_into_same_client_reuses_handle() {
    let (device, _stats) = get_test_device();
    let exporter = Session::open(&device).unwrap();
    let importer = Session::open(&device).unwrap();
    assert_ne!(exporter.client().display_name(), importer.client().display_name());

    let handle = exporter
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    assert_eq!(
        exporter.client().handle_refs(handle).unwrap(),
        HandleRefs {
            ref_count: 1,
            user_ref_count: 1,
            kmap_count: 0
        }
    );

    let descriptor = exporter.share(handle).unwrap();
    assert_eq!(descriptor, Descriptor(0));
    assert_eq!(exporter.client().handle_debug(handle).unwrap().descriptor, Some(descriptor));

    let imported = importer.import(descriptor).unwrap();
    assert_eq!(importer.import(descriptor).unwrap(), imported);
    assert_eq!(importer.client().handle_count(), 1);
    assert_eq!(
        importer.client().handle_refs(imported).unwrap(),
        HandleRefs {
            ref_count: 1,
            user_ref_count: 2,
            kmap_count: 0
        }
    );
    assert_eq!(importer.client().handle_debug(imported).unwrap().descriptor, Some(descriptor));

    importer.free(imported).unwrap();
    importer.free(imported).unwrap();
    assert_eq!(importer.free(imported), Err(IonError::InvalidHandle(imported)));
    assert_eq!(importer.client().handle_count(), 0);

    // the exporter's own import reuses its handle as well
    assert_eq!(exporter.import(descriptor).unwrap(), handle);
    assert_eq!(exporter.client().handle_refs(handle).unwrap().user_ref_count, 2);
}

#[test]
fn test_session_free_without_user_reference() {
    let (device, _stats) = get_test_device();
    let session = Session::open(&device).unwrap();

    // allocated without a user reference
    let handle = session
        .client()
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let before = session.client().handle_refs(handle).unwrap();

    assert!(matches!(session.free(handle), Err(IonError::DoubleRelease(_))));
    assert_eq!(session.client().handle_refs(handle).unwrap(), before);
    assert_eq!(before.ref_count, 1);

    assert_eq!(session.free(HandleId(77)), Err(IonError::InvalidHandle(HandleId(77))));
}

#[test]
fn test_foreign_tokens_are_rejected() {
    let (device, _stats) = get_test_device();
    let session = Session::open(&device).unwrap();

    let token = ShareToken::from_exporter(Arc::new(ForeignBuffer));
    assert_eq!(token.size(), PAGE_SIZE);
    assert!(matches!(token.map_attachment(DmaDirection::ToDevice), Err(IonError::NotSupported(_))));
    assert_eq!(
        session.client().import_token(&token),
        Err(IonError::ForeignToken)
    );

    let descriptor = device.install_descriptor(token).unwrap();
    assert_eq!(session.import(descriptor), Err(IonError::ForeignToken));
    assert_eq!(session.sync(descriptor), Err(IonError::ForeignToken));
    assert_eq!(session.client().handle_count(), 0);

    // a token of another device is just as foreign
    let (other_device, _other_stats) = get_test_device();
    let other = other_device.create_client("other").unwrap();
    let handle = other
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let token = other.share(handle).unwrap();
    assert_eq!(
        session.client().import_token(&token),
        Err(IonError::ForeignToken)
    );
}

#[test]
fn test_full_descriptor_table_releases_token() {
    let (device, stats) = get_test_device_with_config(IonConfig {
        max_descriptors: 2,
        ..test_config()
    });
    let session = Session::open(&device).unwrap();
    let handle = session
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let buffer_id = session.client().buffer(handle).unwrap().id();

    let first = session.share(handle).unwrap();
    let second = session.share(handle).unwrap();
    assert_eq!((first, second), (Descriptor(0), Descriptor(1)));
    assert_eq!(device.buffer_ref_count(buffer_id), Some(3));

    assert_eq!(session.share(handle), Err(IonError::TooManyDescriptors));
    assert_eq!(device.buffer_ref_count(buffer_id), Some(3));
    assert_eq!(device.open_descriptors(), 2);

    device.close_descriptor(first).unwrap();
    assert_eq!(device.close_descriptor(first), Err(IonError::BadDescriptor(first)));
    assert_eq!(device.buffer_ref_count(buffer_id), Some(2));
    assert_eq!(session.share(handle).unwrap(), Descriptor(0));

    // the descriptors keep the buffer alive without any handle
    session.free(handle).unwrap();
    assert!(device.contains_buffer(buffer_id));
    device.close_descriptor(Descriptor(0)).unwrap();
    device.close_descriptor(second).unwrap();
    assert!(!device.contains_buffer(buffer_id));
    assert_eq!(stats.live(), 0);
}

#[derive(Debug, Default, Clone, Copy)]
struct ModelRefs {
    buffer: Option<BufferId>,
    plain: u32,
    user: u32,
}

#[test]
fn test_random_sharing_keeps_counts_consistent() {
    const SEED: u64 = 3_981_204_771_650_392_113;
    const CLIENTS: usize = 4;

    let (device, stats) = get_test_device();
    add_test_heap(&device, HeapId(1), TestHeapModule::new("second"));
    let mask = SYSTEM_HEAP.mask() | HeapId(1).mask();

    let sessions: Vec<Session> = (0..CLIENTS).map(|_| Session::open(&device).unwrap()).collect();
    let mut model: BTreeMap<(usize, HandleId), ModelRefs> = BTreeMap::new();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(SEED);

    for _ in 0..2000 {
        let client = rng.next_u32() as usize % CLIENTS;
        let picked = if model.is_empty() {
            None
        } else {
            let n = rng.next_u32() as usize % model.len();
            model.keys().nth(n).copied()
        };

        match (rng.next_u32() % 5, picked) {
            (0, _) | (_, None) => {
                let len = (1 + rng.next_u32() as usize % 4) * PAGE_SIZE;
                let handle = sessions[client].alloc(len, 0, mask, AllocationFlags::empty()).unwrap();
                let entry = model.entry((client, handle)).or_default();
                entry.buffer = Some(sessions[client].client().buffer(handle).unwrap().id());
                entry.user += 1;
            }
            (1, Some(_)) => {
                let handle = sessions[client]
                    .client()
                    .alloc(PAGE_SIZE, 0, mask, AllocationFlags::CACHED)
                    .unwrap();
                let entry = model.entry((client, handle)).or_default();
                entry.buffer = Some(sessions[client].client().buffer(handle).unwrap().id());
                entry.plain += 1;
            }
            (2, Some((owner, handle))) => {
                let buffer = model[&(owner, handle)].buffer;
                let descriptor = sessions[owner].share(handle).unwrap();
                let as_user = rng.next_u32() % 2 == 0;
                let imported = if as_user {
                    sessions[client].import(descriptor).unwrap()
                } else {
                    sessions[client].client().import(descriptor).unwrap()
                };
                device.close_descriptor(descriptor).unwrap();

                let entry = model.entry((client, imported)).or_default();
                assert!(entry.buffer.is_none() || entry.buffer == buffer);
                entry.buffer = buffer;
                if as_user {
                    entry.user += 1;
                } else {
                    entry.plain += 1;
                }
            }
            (3, Some(key)) => {
                let entry = model.get_mut(&key).unwrap();
                if entry.user == 0 {
                    assert!(matches!(sessions[key.0].free(key.1), Err(IonError::DoubleRelease(_))));
                } else {
                    sessions[key.0].free(key.1).unwrap();
                    entry.user -= 1;
                }
            }
            (_, Some(key)) => {
                let entry = model.get_mut(&key).unwrap();
                if entry.plain > 0 {
                    sessions[key.0].client().free(key.1).unwrap();
                    entry.plain -= 1;
                }
            }
        }
        model.retain(|_, refs| refs.plain + refs.user > 0);

        // every handle matches the model
        let mut handles_per_buffer: BTreeMap<BufferId, usize> = BTreeMap::new();
        for ((client, handle), refs) in model.iter() {
            let actual = sessions[*client].client().handle_refs(*handle).unwrap();
            let lifetime = refs.plain + u32::from(refs.user > 0);
            assert_eq!(actual.ref_count, lifetime);
            assert_eq!(actual.user_ref_count, refs.user);
            assert!(actual.ref_count >= 1);
            *handles_per_buffer.entry(refs.buffer.unwrap()).or_default() += 1;
        }
        for (index, session) in sessions.iter().enumerate() {
            let expected = model.keys().filter(|(client, _)| *client == index).count();
            assert_eq!(session.client().handle_count(), expected);
        }

        // no descriptors are open, so only handles keep buffers alive
        assert_eq!(device.buffer_count(), handles_per_buffer.len());
        for (buffer, handles) in handles_per_buffer.iter() {
            assert_eq!(device.buffer_ref_count(*buffer), Some(*handles));
        }
    }

    drop(sessions);
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(stats.live(), 0);
}

#[test]
fn test_reference_counts_do_not_wrap() {
    let (device, _stats) = get_test_device();
    let session = Session::open(&device).unwrap();
    let client = session.client();
    let handle = session
        .alloc(PAGE_SIZE, 0, SYSTEM_HEAP.mask(), AllocationFlags::empty())
        .unwrap();
    let descriptor = session.share(handle).unwrap();

    // lifetime references
    client.preset_handle_refs(handle, u32::MAX, 1).unwrap();
    let before = client.handle_refs(handle).unwrap();
    assert_eq!(client.handle_get(handle), Err(IonError::Overflow));
    assert_eq!(client.handle_refs(handle).unwrap(), before);
    assert_eq!(session.import(descriptor), Err(IonError::Overflow));
    assert_eq!(client.handle_refs(handle).unwrap(), before);

    // user references
    client.preset_handle_refs(handle, 2, u32::MAX).unwrap();
    let before = client.handle_refs(handle).unwrap();
    client.handle_get(handle).unwrap();
    assert_eq!(client.pass_to_user(handle), Err(IonError::Overflow));
    assert_eq!(client.handle_refs(handle).unwrap(), before);
    assert_eq!(session.import(descriptor), Err(IonError::Overflow));
    assert_eq!(client.handle_refs(handle).unwrap(), before);

    // the first user reference also takes a lifetime reference
    client.preset_handle_refs(handle, u32::MAX - 1, 0).unwrap();
    let before = client.handle_refs(handle).unwrap();
    assert_eq!(session.import(descriptor), Err(IonError::Overflow));
    assert_eq!(client.handle_refs(handle).unwrap(), before);

    client.preset_handle_refs(handle, 2, 1).unwrap();
    assert_eq!(session.import(descriptor), Ok(handle));
    assert_eq!(
        client.handle_refs(handle).unwrap(),
        HandleRefs {
            ref_count: 2,
            user_ref_count: 2,
            kmap_count: 0,
        }
    );
    let buffer_id = client.buffer(handle).unwrap().id();
    assert_eq!(device.buffer_ref_count(buffer_id), Some(2));
}
