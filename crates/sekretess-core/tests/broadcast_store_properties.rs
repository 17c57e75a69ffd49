//! Property tests for the broadcast-session halves.
//!
//! Both backends must keep the two halves of a broadcast session consistent
//! under any interleaving of half writes:
//! - A write preserves the other half when the distribution id is unchanged
//! - A write with a new distribution id drops the stale other half
//! - The halves never reference different distribution ids

use proptest::prelude::*;
use sekretess_core::{
    BroadcastSessionStore, DistributionId, MemoryStorage, RedbStorage, StoredBroadcastSession,
};
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum HalfWrite {
    SenderKey { id: u8, record: Vec<u8> },
    DistributionMessage { id: u8, message: Vec<u8> },
}

fn half_write() -> impl Strategy<Value = HalfWrite> {
    // Few ids so that writes often hit the same distribution id
    prop_oneof![
        (0u8..3, prop::collection::vec(any::<u8>(), 1..32))
            .prop_map(|(id, record)| HalfWrite::SenderKey { id, record }),
        (0u8..3, prop::collection::vec(any::<u8>(), 1..32))
            .prop_map(|(id, message)| HalfWrite::DistributionMessage { id, message }),
    ]
}

fn dist(id: u8) -> DistributionId {
    DistributionId::from_random_bytes([id; 16])
}

/// Reference model of the merge rule.
fn apply(model: Option<StoredBroadcastSession>, write: &HalfWrite) -> StoredBroadcastSession {
    let (id, keep) = match write {
        HalfWrite::SenderKey { id, .. } | HalfWrite::DistributionMessage { id, .. } => {
            (dist(*id), model.filter(|m| m.distribution_id == dist(*id)))
        },
    };
    let mut next = keep.unwrap_or(StoredBroadcastSession {
        name: "acme".to_string(),
        device_id: 1,
        distribution_id: id,
        sender_key_record: None,
        distribution_message: None,
    });
    match write {
        HalfWrite::SenderKey { record, .. } => next.sender_key_record = Some(record.clone()),
        HalfWrite::DistributionMessage { message, .. } => {
            next.distribution_message = Some(message.clone());
        },
    }
    next
}

fn run(store: &impl BroadcastSessionStore, writes: &[HalfWrite]) -> Result<(), TestCaseError> {
    let mut model = None;
    for write in writes {
        match write {
            HalfWrite::SenderKey { id, record } => {
                store.save_broadcast_session("acme", 1, dist(*id), record).unwrap();
            },
            HalfWrite::DistributionMessage { id, message } => {
                store.save_distribution_message("acme", 1, dist(*id), message).unwrap();
            },
        }
        model = Some(apply(model, write));

        let loaded = store.load_broadcast_session("acme").unwrap();
        prop_assert_eq!(&loaded, &model);
    }
    Ok(())
}

#[test]
fn prop_memory_halves_follow_merge_rule() {
    proptest!(|(writes in prop::collection::vec(half_write(), 1..20))| {
        run(&MemoryStorage::new(), &writes)?;
    });
}

#[test]
fn prop_redb_halves_follow_merge_rule() {
    proptest!(
        ProptestConfig::with_cases(32),
        |(writes in prop::collection::vec(half_write(), 1..12))| {
            let dir = tempdir().unwrap();
            let storage = RedbStorage::open(dir.path().join("broadcast.redb")).unwrap();
            run(&storage, &writes)?;
        }
    );
}

#[test]
fn sender_key_write_after_distribution_message_keeps_both() {
    let storage = MemoryStorage::new();
    storage.save_distribution_message("acme", 1, dist(1), b"dist").unwrap();
    storage.save_broadcast_session("acme", 1, dist(1), b"record").unwrap();

    let loaded = storage.load_broadcast_session("acme").unwrap().unwrap();
    assert!(loaded.is_complete());
    assert_eq!(loaded.distribution_message.as_deref(), Some(&b"dist"[..]));
}

#[test]
fn distribution_message_write_after_sender_key_keeps_both() {
    let storage = MemoryStorage::new();
    storage.save_broadcast_session("acme", 1, dist(1), b"record").unwrap();
    storage.save_distribution_message("acme", 1, dist(1), b"dist").unwrap();

    let loaded = storage.load_broadcast_session("acme").unwrap().unwrap();
    assert!(loaded.is_complete());
    assert_eq!(loaded.sender_key_record.as_deref(), Some(&b"record"[..]));
}
