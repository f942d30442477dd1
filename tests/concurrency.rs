use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tagtree::error::StoreResult;
use tagtree::{
    Database, NewTag, SqliteTagStore, TagId, TagNode, TagService, TagStore, TagWriter,
};

#[test]
fn test_readers_never_see_half_moved_subtree() {
    let service = Arc::new(TagService::with_database(
        Database::in_memory().expect("in-memory database"),
    ));

    let left = service.add_tag(NewTag::root("left")).unwrap();
    let right = service.add_tag(NewTag::root("right")).unwrap();
    let mover = service
        .add_tag(NewTag::child("mover", left.id().clone()))
        .unwrap();
    let mut below: Vec<TagId> = Vec::new();
    let mut parent = mover.id().clone();
    for i in 0..5 {
        parent = service
            .add_tag(NewTag::child(format!("deep-{i}"), parent))
            .unwrap()
            .id()
            .clone();
        below.push(parent.clone());
    }
    let moved: HashSet<TagId> = below
        .iter()
        .cloned()
        .chain(std::iter::once(mover.id().clone()))
        .collect();

    thread::scope(|s| {
        let writer = {
            let service = Arc::clone(&service);
            let (left, right, mover, below) =
                (left.clone(), right.clone(), mover.clone(), below.clone());
            s.spawn(move || {
                for i in 0..50 {
                    let target = if i % 2 == 0 { &right } else { &left };
                    service
                        .update_tag(
                            NewTag::child("mover", target.id().clone())
                                .with_id(mover.id().clone()),
                        )
                        .unwrap();

                    // A short-lived leaf inside the moving block.
                    let deepest = below.last().unwrap().clone();
                    let scratch = service
                        .add_tag(NewTag::child(format!("scratch-{i}"), deepest))
                        .unwrap();
                    assert!(service.delete_tag(scratch.id()).unwrap());
                }
            })
        };

        for _ in 0..4 {
            let service = Arc::clone(&service);
            let (left, right, moved) = (left.clone(), right.clone(), moved.clone());
            s.spawn(move || {
                for _ in 0..200 {
                    let in_left: HashSet<TagId> = service
                        .subtree(left.id())
                        .unwrap()
                        .iter()
                        .map(|t| t.id().clone())
                        .collect();
                    let in_right: HashSet<TagId> = service
                        .subtree(right.id())
                        .unwrap()
                        .iter()
                        .map(|t| t.id().clone())
                        .collect();

                    // Each subtree read holds the moved block entirely or not at all.
                    for ids in [&in_left, &in_right] {
                        let present = moved.iter().filter(|id| ids.contains(*id)).count();
                        assert!(present == 0 || present == moved.len());
                    }
                }
            });
        }

        writer.join().unwrap();
    });

    // 50 moves, the last one (i = 49) lands back under left.
    assert_eq!(service.subtree(left.id()).unwrap().len(), 1 + moved.len());
    assert_eq!(service.verify_cache().unwrap(), None);
    assert!(service.detect_drift().unwrap().is_clean());
}

/// Store that counts bulk loads and slows them down so racing callers overlap.
struct CountingStore {
    inner: SqliteTagStore,
    loads: AtomicUsize,
}

impl TagStore for CountingStore {
    fn query_root_tags_with_children(&self) -> StoreResult<Vec<TagNode>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.inner.query_root_tags_with_children()
    }

    fn transaction<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn TagWriter) -> StoreResult<T>,
    {
        self.inner.transaction(work)
    }
}

#[test]
fn test_concurrent_first_reads_build_one_cache() {
    let inner = SqliteTagStore::new(Database::in_memory().expect("in-memory database"));
    inner
        .with_connection(|conn| {
            conn.execute_batch(
                "INSERT INTO tags (id, name, parent_id, date_created, date_updated) VALUES
                 ('r', 'r', NULL, 0, 0),
                 ('c1', 'c1', 'r', 0, 0),
                 ('c2', 'c2', 'r', 0, 0);",
            )
        })
        .unwrap();
    let service = TagService::new(CountingStore {
        inner,
        loads: AtomicUsize::new(0),
    });

    thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| s.spawn(|| service.get_all_tags().unwrap().len()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
    });

    // Later writes and reads reuse the warm cache.
    let added = service
        .add_tag(NewTag::child("c3", TagId::new("r")))
        .unwrap();
    assert_eq!(service.subtree(&TagId::new("r")).unwrap().len(), 4);
    assert_eq!(service.get_tag(added.id()).unwrap().name(), "c3");
    assert_eq!(service.store().loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_adds_are_all_applied() {
    let service = Arc::new(TagService::with_database(
        Database::in_memory().expect("in-memory database"),
    ));
    let root = service.add_tag(NewTag::root("root")).unwrap();

    thread::scope(|s| {
        for t in 0..4 {
            let service = Arc::clone(&service);
            let root = root.id().clone();
            s.spawn(move || {
                for i in 0..10 {
                    service
                        .add_tag(NewTag::child(format!("t{t}-{i}"), root.clone()))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(service.subtree(root.id()).unwrap().len(), 41);
    assert!(service.detect_drift().unwrap().is_clean());
}
