use super::{OverflowStore, Persistence};
use crate::broker::message::{Message, RecordId};
use crate::utils::error::Error;

use std::fs;
use tempfile::tempdir;

const LOG: &str = "test:log";

fn msg(content: &str) -> Message {
    Message::new("claude", "all", "note", content).unwrap()
}

#[test]
fn test_append_and_read_after() {
    let store = Persistence::temporary().unwrap();

    let a = store.append(LOG, &msg("one"), None).unwrap();
    let b = store.append(LOG, &msg("two"), None).unwrap();
    let c = store.append(LOG, &msg("three"), None).unwrap();
    assert!(a < b && b < c);

    let all = store.read_after(LOG, None, 10).unwrap();
    let contents: Vec<_> = all.iter().map(|r| r.message.content()).collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    let tail = store.read_after(LOG, Some(a), 10).unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].id, b);

    let limited = store.read_after(LOG, None, 1).unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, a);
}

#[test]
fn test_auto_ids_stay_above_explicit_ids() {
    let store = Persistence::temporary().unwrap();
    let future = RecordId::new(u64::MAX / 2, 7);
    store.append(LOG, &msg("from elsewhere"), Some(future)).unwrap();

    let next = store.append(LOG, &msg("local"), None).unwrap();
    assert_eq!(next, RecordId::new(u64::MAX / 2, 8));
}

#[test]
fn test_auto_ids_interleaved_with_explicit_ids() {
    let store = Persistence::temporary().unwrap();
    let base = store.append(LOG, &msg("first"), None).unwrap();

    let mut highest = base;
    for round in 1..=5u64 {
        let ahead = RecordId::new(base.millis + round * 1_000, 0);
        store.append(LOG, &msg("replicated"), Some(ahead)).unwrap();
        highest = highest.max(ahead);

        let local = store.append(LOG, &msg("local"), None).unwrap();
        assert!(local > highest, "{local} not above {highest}");
        highest = local;
    }

    // an older replicated record does not pull later ids back down
    store.append(LOG, &msg("old"), Some(RecordId::new(1, 0))).unwrap();
    let after_old = store.append(LOG, &msg("local"), None).unwrap();
    assert!(after_old > highest);
}

#[test]
fn test_reader_cursor_never_skips_auto_ids() {
    let store = Persistence::temporary().unwrap();
    let start = store.append(LOG, &msg("seed"), None).unwrap();

    let (auto_ids, seen) = std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            (0..200)
                .map(|_| store.append(LOG, &msg("local"), None).unwrap())
                .collect::<Vec<_>>()
        });
        scope.spawn(|| {
            for i in 1..=50u64 {
                let ahead = RecordId::new(start.millis + i * 3, 0);
                // a concurrent auto append may already hold that id
                let _ = store.append(LOG, &msg("remote"), Some(ahead));
            }
        });
        let reader = scope.spawn(|| {
            let mut cursor = Some(start);
            let mut seen = std::collections::BTreeSet::new();
            for _ in 0..500 {
                for record in store.read_after(LOG, cursor, 1000).unwrap() {
                    seen.insert(record.id);
                    cursor = Some(record.id);
                }
            }
            (cursor, seen)
        });

        let auto_ids = writer.join().unwrap();
        let (cursor, mut seen) = reader.join().unwrap();
        // drain whatever landed after the reader's last pass
        for record in store.read_after(LOG, cursor, usize::MAX).unwrap() {
            seen.insert(record.id);
        }
        (auto_ids, seen)
    });

    let missed: Vec<_> = auto_ids.iter().filter(|id| !seen.contains(id)).collect();
    assert!(missed.is_empty(), "records landed below the cursor: {missed:?}");
}

#[test]
fn test_duplicate_id_leaves_log_unchanged() {
    let store = Persistence::temporary().unwrap();
    let id = RecordId::new(42, 0);
    let original = msg("original");
    store.append(LOG, &original, Some(id)).unwrap();

    let err = store.append(LOG, &msg("impostor"), Some(id)).unwrap_err();
    assert!(matches!(err, Error::DuplicateRecord(dup) if dup == id));

    let records = store.read_after(LOG, None, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message, original);
}

#[test]
fn test_explicit_ids_merge_in_order() {
    let store = Persistence::temporary().unwrap();
    store.append(LOG, &msg("4"), Some(RecordId::new(4, 0))).unwrap();
    store.append(LOG, &msg("3"), Some(RecordId::new(3, 0))).unwrap();

    let ids: Vec<_> = store
        .read_after(LOG, None, 10)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![RecordId::new(3, 0), RecordId::new(4, 0)]);
}

#[test]
fn test_read_recent_is_most_recent_first() {
    let store = Persistence::temporary().unwrap();
    for i in 1..=5 {
        store.append(LOG, &msg(&i.to_string()), Some(RecordId::new(i, 0))).unwrap();
    }

    let recent = store.read_recent(LOG, 3).unwrap();
    let contents: Vec<_> = recent.iter().map(|r| r.message.content()).collect();
    assert_eq!(contents, vec!["5", "4", "3"]);
    assert_eq!(store.len(LOG).unwrap(), 5);
}

#[test]
fn test_empty_log_returns_empty_vec() {
    let store = Persistence::temporary().unwrap();
    assert!(store.read_after("nonexistent", None, 10).unwrap().is_empty());
    assert!(store.read_recent("nonexistent", 10).unwrap().is_empty());
}

#[test]
fn test_logs_are_isolated_by_key() {
    let store = Persistence::temporary().unwrap();
    store.append("a", &msg("for a"), None).unwrap();
    assert_eq!(store.len("a").unwrap(), 1);
    assert_eq!(store.len("b").unwrap(), 0);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = Persistence::open(dir.path()).unwrap();
        assert_eq!(store.get_state("sync:state").unwrap(), None);
        store.set_state("sync:state", "{\"x\":1}").unwrap();
        store.flush().unwrap();
    }
    let store = Persistence::open(dir.path()).unwrap();
    assert_eq!(
        store.get_state("sync:state").unwrap().as_deref(),
        Some("{\"x\":1}")
    );
}

#[test]
fn test_overflow_push_and_load() {
    let dir = tempdir().unwrap();
    let overflow = OverflowStore::new(dir.path().join("nested").join("failed_messages.jsonl"));
    assert!(overflow.load().unwrap().is_empty());

    let first = msg("first");
    let second = msg("second");
    overflow.push(&first).unwrap();
    overflow.push(&second).unwrap();

    let raw = fs::read_to_string(overflow.path()).unwrap();
    assert_eq!(raw.lines().count(), 2);
    assert_eq!(overflow.load().unwrap(), vec![first, second]);
}

#[test]
fn test_overflow_skips_garbage_lines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("failed_messages.jsonl");
    let good = msg("good");
    fs::write(
        &path,
        format!("not json\n{}\n\n", serde_json::to_string(&good).unwrap()),
    )
    .unwrap();

    let overflow = OverflowStore::new(&path);
    assert_eq!(overflow.load().unwrap(), vec![good]);
}

#[test]
fn test_overflow_replace() {
    let dir = tempdir().unwrap();
    let overflow = OverflowStore::new(dir.path().join("failed_messages.jsonl"));
    let keep = msg("keep");
    overflow.push(&msg("drop")).unwrap();
    overflow.push(&keep).unwrap();

    overflow.replace(std::slice::from_ref(&keep)).unwrap();
    assert_eq!(overflow.load().unwrap(), vec![keep]);

    overflow.replace(&[]).unwrap();
    assert!(!overflow.path().exists());
    overflow.replace(&[]).unwrap();
}
