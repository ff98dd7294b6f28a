use std::sync::{Arc, Barrier};

use thiserror::Error;

use facegate_core::{
    update_identity, IdentityId, IdentityStore, MemoryIdentityStore, NewIdentity, SlotError,
    StoreError, DEFAULT_CONFLICT_RETRIES,
};

#[derive(Debug, Error)]
enum AddError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn seeded_identity(store: &MemoryIdentityStore, occupied: usize) -> IdentityId {
    let id = store.create(NewIdentity::named("Jan Kowalski")).unwrap().id;
    for i in 0..occupied {
        update_identity(store, id, 0, |record| {
            record.slots.add(vec![i as f32, 1.0, 0.0], None)?;
            Ok::<_, AddError>(())
        })
        .unwrap();
    }
    id
}

fn race_adds(
    store: Arc<MemoryIdentityStore>,
    id: IdentityId,
    writers: usize,
) -> Vec<Result<usize, AddError>> {
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let store = store.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                update_identity(store.as_ref(), id, DEFAULT_CONFLICT_RETRIES, |record| {
                    let slot = record
                        .slots
                        .add(vec![w as f32, 0.0, 1.0], Some(format!("writer-{w}.jpg")))?;
                    Ok::<_, AddError>(slot.get())
                })
                .map(|(slot, _)| slot)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_last_free_slot_is_claimed_exactly_once() {
    for _ in 0..20 {
        let store = Arc::new(MemoryIdentityStore::new());
        let id = seeded_identity(&store, 4);

        let results = race_adds(store.clone(), id, 2);

        let winners: Vec<usize> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().copied())
            .collect();
        assert_eq!(winners, vec![5]);
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(
            loser,
            Err(AddError::Slot(SlotError::Full { .. }))
                | Err(AddError::Store(StoreError::Conflict { .. }))
        ));

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.slots.count(), 5);
    }
}

#[test]
fn test_concurrent_adds_land_in_distinct_slots() {
    for _ in 0..20 {
        let store = Arc::new(MemoryIdentityStore::new());
        let id = seeded_identity(&store, 2);

        let results = race_adds(store.clone(), id, 3);

        let mut slots: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![3, 4, 5]);

        let record = store.get(id).unwrap().unwrap();
        assert!(record.slots.is_full());
        // Provenance stayed attached to the vector it was written with
        for entry in record.slots.entries().iter().skip(2) {
            let writer = entry.vector[0] as usize;
            let expected = format!("writer-{writer}.jpg");
            assert_eq!(entry.provenance.as_deref(), Some(expected.as_str()));
        }
    }
}
