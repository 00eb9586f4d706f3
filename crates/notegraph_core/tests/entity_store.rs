use notegraph_core::db::{open_db, open_db_in_memory};
use notegraph_core::{
    Attribute, Branch, ChangeLog, EntityName, EntityRow, EntityStore, Note, NoteType,
    SqliteEntityStore, StoreError, ROOT_NOTE_ID,
};

fn setup() -> rusqlite::Connection {
    open_db_in_memory().unwrap()
}

fn text_note(note_id: &str, title: &str) -> Note {
    Note::with_id(note_id, title, b"body".to_vec(), NoteType::Text, "text/html")
}

#[test]
fn put_then_get_returns_written_state() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    store.put_note(text_note("n1", "First")).unwrap();
    store.put_branch(Branch::new("n1", ROOT_NOTE_ID, 10)).unwrap();

    let note = store.get_note("n1").unwrap().unwrap();
    assert_eq!(note.title, "First");
    assert_eq!(note.content, b"body".to_vec());
    assert!(note.date_modified > 0);

    let branch = store.get_branch("root_n1").unwrap().unwrap();
    assert_eq!(branch.note_id, "n1");
    assert_eq!(branch.parent_note_id, ROOT_NOTE_ID);
    assert_eq!(branch.note_position, 10);

    let row = store.get(EntityName::Branch, "root_n1").unwrap();
    assert_eq!(row, EntityRow::Branch(branch));
}

#[test]
fn get_missing_entity_reports_not_found() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    assert!(store.get_note("missing").unwrap().is_none());
    match store.get(EntityName::Note, "missing") {
        Err(StoreError::NotFound { entity, id }) => {
            assert_eq!(entity, EntityName::Note);
            assert_eq!(id, "missing");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn delete_missing_entity_reports_not_found_and_logs_nothing() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let err = store.delete(EntityName::Attribute, "missing").unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let log = ChangeLog::try_new(&conn).unwrap();
    assert_eq!(log.last_sequence_id().unwrap(), 0);
}

#[test]
fn every_write_appends_exactly_one_record() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let first = store.put_note(text_note("n1", "First")).unwrap();
    let second = store.put_branch(Branch::new("n1", ROOT_NOTE_ID, 10)).unwrap();
    let third = store
        .put_attribute(Attribute::label("n1", "color", "blue"))
        .unwrap();
    let fourth = store.delete(EntityName::Branch, "root_n1").unwrap();
    assert!(first < second && second < third && third < fourth);

    let log = ChangeLog::try_new(&conn).unwrap();
    let records = log.records_since(0).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(
        records.iter().map(|record| record.sequence_id).collect::<Vec<_>>(),
        vec![first, second, third, fourth]
    );
    assert!(records
        .iter()
        .all(|record| record.source_id == store.source_id()));
    assert!(records
        .iter()
        .all(|record| record.origin_sequence_id == record.sequence_id));
    assert!(records
        .windows(2)
        .all(|pair| pair[0].timestamp < pair[1].timestamp));

    let tombstone = &records[3];
    assert!(tombstone.is_erased);
    assert!(tombstone.payload.is_none());
    assert_eq!(tombstone.entity_name, EntityName::Branch);
    assert_eq!(tombstone.entity_id, "root_n1");

    let note_record = &records[0];
    assert_eq!(
        note_record.payload,
        Some(EntityRow::Note(store.get_note("n1").unwrap().unwrap()))
    );
}

#[test]
fn records_since_is_restartable_from_any_id() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    for index in 0..5 {
        store
            .put_note(text_note(&format!("n{index}"), "title"))
            .unwrap();
    }

    let log = ChangeLog::try_new(&conn).unwrap();
    let all = log.records_since(0).unwrap();
    let tail = log.records_since(all[2].sequence_id).unwrap();
    assert_eq!(tail, all[3..].to_vec());

    let page = log.records_page(0, 2).unwrap();
    assert_eq!(page, all[..2].to_vec());
    assert!(log.records_since(all[4].sequence_id).unwrap().is_empty());
}

#[test]
fn atomically_rolls_back_every_write_on_error() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let result = store.atomically::<(), StoreError, _>(|| {
        store.put_note(text_note("n1", "First"))?;
        store.put_branch(Branch::new("n1", ROOT_NOTE_ID, 10))?;
        Err(StoreError::InvalidData("abort".to_string()))
    });
    assert!(result.is_err());

    assert!(store.get_note("n1").unwrap().is_none());
    assert!(store.get_branch("root_n1").unwrap().is_none());
    let log = ChangeLog::try_new(&conn).unwrap();
    assert!(log.records_since(0).unwrap().is_empty());
}

#[test]
fn sequence_ids_keep_growing_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let last_before = {
        let conn = open_db(&path).unwrap();
        let store = SqliteEntityStore::try_new(&conn).unwrap();
        store.put_note(text_note("n1", "First")).unwrap();
        store.put_note(text_note("n2", "Second")).unwrap()
    };

    let conn = open_db(&path).unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    assert_eq!(store.get_note("n2").unwrap().unwrap().title, "Second");
    let next = store.put_note(text_note("n3", "Third")).unwrap();
    assert!(next > last_before);
}

#[test]
fn child_branches_come_back_in_sibling_order() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    for (note_id, position) in [("a", 30), ("b", 10), ("c", 20)] {
        store.put_note(text_note(note_id, note_id)).unwrap();
        store
            .put_branch(Branch::new(note_id, ROOT_NOTE_ID, position))
            .unwrap();
    }

    let order = store
        .child_branches(ROOT_NOTE_ID)
        .unwrap()
        .into_iter()
        .map(|branch| branch.note_id)
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["b", "c", "a"]);
    assert_eq!(store.find_branch("a", ROOT_NOTE_ID).unwrap().unwrap().note_position, 30);
}

#[test]
fn note_ids_with_the_branch_separator_are_refused() {
    let conn = setup();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    store.put_note(text_note("a", "A")).unwrap();
    store.put_note(text_note("b", "B")).unwrap();
    let log = ChangeLog::try_new(&conn).unwrap();
    let sequence_before = log.last_sequence_id().unwrap();

    let err = store.put_note(text_note("a_x", "aliased")).unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert!(matches!(
        store.put_note(text_note("", "blank")),
        Err(StoreError::InvalidData(_))
    ));

    // ("a", "x_b") and ("a_x", "b") would both be "a_x_b".
    let err = store.put_branch(Branch::new("x_b", "a", 10)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    let err = store.put_branch(Branch::new("b", "a_x", 10)).unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));

    assert!(store.get_branch("a_x_b").unwrap().is_none());
    assert_eq!(log.last_sequence_id().unwrap(), sequence_before);
}
