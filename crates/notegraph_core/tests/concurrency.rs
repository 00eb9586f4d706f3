use notegraph_core::db::open_db;
use notegraph_core::{
    ChangeLog, GraphSnapshot, NewNote, Placement, RelocationService, SqliteEntityStore,
    ROOT_NOTE_ID,
};
use std::collections::BTreeSet;
use std::thread;

const WRITERS: usize = 4;
const NOTES_PER_WRITER: usize = 8;

#[test]
fn concurrent_writers_keep_sibling_positions_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    drop(open_db(&path).unwrap());

    let handles = (0..WRITERS)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let service = RelocationService::new(SqliteEntityStore::try_new(&conn).unwrap());
                for index in 0..NOTES_PER_WRITER {
                    service
                        .create_note(
                            NewNote::text(format!("writer {writer} note {index}")),
                            Placement::Into(ROOT_NOTE_ID.to_string()),
                        )
                        .unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    let conn = open_db(&path).unwrap();
    let snapshot = GraphSnapshot::load(&conn).unwrap();
    let children = snapshot.children(ROOT_NOTE_ID);
    assert_eq!(children.len(), WRITERS * NOTES_PER_WRITER);
    let positions = children
        .iter()
        .map(|branch| branch.note_position)
        .collect::<BTreeSet<_>>();
    assert_eq!(positions.len(), children.len());

    let records = ChangeLog::try_new(&conn).unwrap().records_since(0).unwrap();
    assert_eq!(records.len(), WRITERS * NOTES_PER_WRITER * 2);
    let sequence_ids = records
        .iter()
        .map(|record| record.sequence_id)
        .collect::<BTreeSet<_>>();
    assert_eq!(sequence_ids.len(), records.len());
}

#[test]
fn concurrent_moves_never_detach_a_note() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("moves.db");
    let (left, right, item) = {
        let conn = open_db(&path).unwrap();
        let service = RelocationService::new(SqliteEntityStore::try_new(&conn).unwrap());
        let create = |title: &str, parent: &str| {
            service
                .create_note(NewNote::text(title), Placement::Into(parent.to_string()))
                .unwrap()
        };
        let left = create("Left", ROOT_NOTE_ID);
        let right = create("Right", ROOT_NOTE_ID);
        let item = create("Item", &left.note.note_id);
        (left.note.note_id, right.note.note_id, item.note.note_id)
    };

    let handles = [left.clone(), right.clone()]
        .into_iter()
        .map(|target| {
            let path = path.clone();
            let item = item.clone();
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let service = RelocationService::new(SqliteEntityStore::try_new(&conn).unwrap());
                for _ in 0..10 {
                    let snapshot = GraphSnapshot::load(&conn).unwrap();
                    let current = snapshot
                        .branches()
                        .find(|branch| branch.note_id == item)
                        .map(|branch| branch.branch_id.clone())
                        .unwrap();
                    // A concurrent move may have replaced the branch since the read.
                    let _ = service.move_to_node(&[current], &target);
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    let conn = open_db(&path).unwrap();
    let snapshot = GraphSnapshot::load(&conn).unwrap();
    let parents = snapshot
        .branches()
        .filter(|branch| branch.note_id == item)
        .map(|branch| branch.parent_note_id.clone())
        .collect::<Vec<_>>();
    assert_eq!(parents.len(), 1);
    assert!(parents[0] == left || parents[0] == right);
}
