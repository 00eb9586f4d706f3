use notegraph_core::db::open_db_in_memory;
use notegraph_core::protect::crypto::decrypt_bytes;
use notegraph_core::{
    download_file, setup_password, upload_file, Clipboard, ClipboardMode, CloneOutcome,
    CreatedNote, EntityStore, FileError, GraphSnapshot, NewNote, NoteType, PasteOutcome,
    Placement, ProtectedSessionProvider, ProtectionService, RelocationService, SessionManager,
    SqliteEntityStore, ROOT_NOTE_ID,
};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

fn service(conn: &Connection) -> RelocationService<SqliteEntityStore<'_>> {
    RelocationService::new(SqliteEntityStore::try_new(conn).unwrap())
}

fn create(
    service: &RelocationService<SqliteEntityStore<'_>>,
    title: &str,
    parent_note_id: &str,
) -> CreatedNote {
    service
        .create_note(
            NewNote::text(title),
            Placement::Into(parent_note_id.to_string()),
        )
        .unwrap()
}

fn child_titles(conn: &Connection, parent_note_id: &str) -> Vec<String> {
    let snapshot = GraphSnapshot::load(conn).unwrap();
    snapshot
        .children(parent_note_id)
        .into_iter()
        .map(|branch| snapshot.note(&branch.note_id).unwrap().title.clone())
        .collect()
}

#[test]
fn cut_and_paste_into_moves_branches_and_clears_clipboard() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let folder = create(&service, "Folder", ROOT_NOTE_ID);
    let first = create(&service, "First", ROOT_NOTE_ID);
    let second = create(&service, "Second", ROOT_NOTE_ID);

    let mut clipboard = Clipboard::new();
    clipboard.cut(vec![
        first.branch.branch_id.clone(),
        second.branch.branch_id.clone(),
    ]);
    assert_eq!(clipboard.mode(), Some(ClipboardMode::Cut));

    match clipboard.paste_into(&service, &folder.note.note_id).unwrap() {
        PasteOutcome::Moved(moved) => assert_eq!(moved.len(), 2),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(clipboard.is_empty());
    assert_eq!(
        child_titles(&conn, &folder.note.note_id),
        vec!["First", "Second"]
    );
    assert_eq!(child_titles(&conn, ROOT_NOTE_ID), vec!["Folder"]);
}

#[test]
fn rejected_cut_paste_keeps_clipboard_contents() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let parent = create(&service, "Parent", ROOT_NOTE_ID);
    let child = create(&service, "Child", &parent.note.note_id);

    let mut clipboard = Clipboard::new();
    clipboard.cut(vec![parent.branch.branch_id.clone()]);
    assert!(clipboard.paste_into(&service, &child.note.note_id).is_err());
    assert_eq!(clipboard.ids().to_vec(), vec![parent.branch.branch_id.clone()]);
}

#[test]
fn copy_and_paste_after_clones_in_clipboard_order() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let folder = create(&service, "Folder", ROOT_NOTE_ID);
    let anchor = create(&service, "Anchor", &folder.note.note_id);
    create(&service, "Tail", &folder.note.note_id);
    let x = create(&service, "X", ROOT_NOTE_ID);
    let y = create(&service, "Y", ROOT_NOTE_ID);

    let mut clipboard = Clipboard::new();
    clipboard.copy(vec![x.note.note_id.clone(), y.note.note_id.clone()]);

    match clipboard
        .paste_after(&service, &anchor.branch.branch_id)
        .unwrap()
    {
        PasteOutcome::Cloned(outcomes) => {
            assert_eq!(outcomes.len(), 2);
            assert!(outcomes
                .iter()
                .all(|outcome| matches!(outcome, Ok(CloneOutcome::Cloned(_)))));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        child_titles(&conn, &folder.note.note_id),
        vec!["Anchor", "X", "Y", "Tail"]
    );
    assert_eq!(child_titles(&conn, ROOT_NOTE_ID), vec!["Folder", "X", "Y"]);
    assert!(!clipboard.is_empty());

    match clipboard.paste_into(&service, &folder.note.note_id).unwrap() {
        PasteOutcome::Cloned(outcomes) => assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, Ok(CloneOutcome::AlreadyPresent(_))))),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn pasting_an_empty_clipboard_does_nothing() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let mut clipboard = Clipboard::new();
    clipboard.copy(Vec::new());

    assert!(matches!(
        clipboard.paste_into(&service, ROOT_NOTE_ID).unwrap(),
        PasteOutcome::Empty
    ));
}

#[test]
fn upload_then_download_returns_original_bytes() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let bytes = vec![0_u8, 1, 2, 3, 255];

    let uploaded = upload_file(&service, ROOT_NOTE_ID, " report.pdf ", bytes.clone(), "").unwrap();
    assert_eq!(uploaded.note.note_type, NoteType::File);
    assert_eq!(uploaded.note.title, "report.pdf");
    assert_eq!(uploaded.note.mime, "application/octet-stream");
    assert_eq!(uploaded.branch.parent_note_id, ROOT_NOTE_ID);
    let labels = uploaded
        .attributes
        .iter()
        .map(|attribute| (attribute.name.as_str(), attribute.value.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![("originalFileName", "report.pdf"), ("fileSize", "5")]
    );

    let download = download_file(service.store(), &uploaded.note.note_id, None).unwrap();
    assert_eq!(download.file_name, "report.pdf");
    assert_eq!(download.mime, "application/octet-stream");
    assert_eq!(download.content, bytes);
}

#[test]
fn upload_rejects_blank_names_and_bad_parents() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let search = service
        .create_note(
            NewNote::new("Query", Vec::new(), NoteType::Search, "application/json"),
            Placement::Into(ROOT_NOTE_ID.to_string()),
        )
        .unwrap();

    assert!(matches!(
        upload_file(&service, ROOT_NOTE_ID, "   ", vec![1], "text/plain"),
        Err(FileError::InvalidFileName)
    ));
    assert!(matches!(
        upload_file(&service, &search.note.note_id, "a.txt", vec![1], "text/plain"),
        Err(FileError::Rejected(_))
    ));
    assert!(matches!(
        upload_file(&service, "ghost", "a.txt", vec![1], "text/plain"),
        Err(FileError::NotFound { .. })
    ));
    assert_eq!(GraphSnapshot::load(&conn).unwrap().note_count(), 2);
}

#[test]
fn protected_file_download_requires_a_session() {
    let conn = open_db_in_memory().unwrap();
    setup_password(&conn, "secret").unwrap();
    let session = Arc::new(SessionManager::new(Duration::from_secs(60)));
    session.start(&conn, "secret").unwrap();

    let service = service(&conn);
    let uploaded = upload_file(&service, ROOT_NOTE_ID, "diary.txt", b"dear diary".to_vec(), "text/plain")
        .unwrap();
    ProtectionService::new(SqliteEntityStore::try_new(&conn).unwrap(), session.clone())
        .protect_subtree(&uploaded.note.note_id, true)
        .unwrap();

    let stored = service
        .store()
        .get_note(&uploaded.note.note_id)
        .unwrap()
        .unwrap();
    assert_ne!(stored.content, b"dear diary".to_vec());
    let key = session.current_key().unwrap();
    assert_eq!(decrypt_bytes(&key, &stored.content).unwrap(), b"dear diary".to_vec());

    assert!(matches!(
        download_file(service.store(), &uploaded.note.note_id, None),
        Err(FileError::SessionUnavailable)
    ));
    let download = download_file(
        service.store(),
        &uploaded.note.note_id,
        Some(session.as_ref() as &dyn ProtectedSessionProvider),
    )
    .unwrap();
    assert_eq!(download.file_name, "diary.txt");
    assert_eq!(download.content, b"dear diary".to_vec());

    session.logout();
    assert!(matches!(
        download_file(
            service.store(),
            &uploaded.note.note_id,
            Some(session.as_ref() as &dyn ProtectedSessionProvider),
        ),
        Err(FileError::SessionUnavailable)
    ));
}
