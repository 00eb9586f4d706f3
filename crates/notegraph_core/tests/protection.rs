use notegraph_core::db::open_db_in_memory;
use notegraph_core::{
    change_password, is_password_set, setup_password, ChangeLog, CreatedNote, EntityStore,
    GraphSnapshot, NewNote, NoteType, Placement, ProtectedSessionProvider, ProtectionError,
    ProtectionService, ProtectionSummary, RelocationService, SessionError, SessionManager,
    SqliteEntityStore, ROOT_NOTE_ID,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

const PASSPHRASE: &str = "correct horse";

fn setup() -> (Connection, Arc<SessionManager>) {
    let conn = open_db_in_memory().unwrap();
    setup_password(&conn, PASSPHRASE).unwrap();
    let session = Arc::new(SessionManager::new(Duration::from_secs(600)));
    (conn, session)
}

fn create(conn: &Connection, title: &str, parent_note_id: &str) -> CreatedNote {
    RelocationService::new(SqliteEntityStore::try_new(conn).unwrap())
        .create_note(
            NewNote::new(title, title.as_bytes().to_vec(), NoteType::Text, "text/html"),
            Placement::Into(parent_note_id.to_string()),
        )
        .unwrap()
}

fn protection<'conn>(
    conn: &'conn Connection,
    session: &Arc<SessionManager>,
) -> ProtectionService<SqliteEntityStore<'conn>> {
    ProtectionService::new(SqliteEntityStore::try_new(conn).unwrap(), session.clone())
}

#[test]
fn protect_subtree_without_session_changes_nothing() {
    let (conn, session) = setup();
    let parent = create(&conn, "Parent", ROOT_NOTE_ID);
    create(&conn, "Child", &parent.note.note_id);

    let before = GraphSnapshot::load(&conn).unwrap();
    let sequence_before = ChangeLog::try_new(&conn).unwrap().last_sequence_id().unwrap();

    let err = protection(&conn, &session)
        .protect_subtree(&parent.note.note_id, true)
        .unwrap_err();
    assert!(matches!(err, ProtectionError::SessionUnavailable));

    assert_eq!(GraphSnapshot::load(&conn).unwrap(), before);
    assert_eq!(
        ChangeLog::try_new(&conn).unwrap().last_sequence_id().unwrap(),
        sequence_before
    );
}

#[test]
fn protect_subtree_encrypts_every_reachable_note_once() {
    let (conn, session) = setup();
    session.start(&conn, PASSPHRASE).unwrap();

    let parent = create(&conn, "Parent", ROOT_NOTE_ID);
    let left = create(&conn, "Left", &parent.note.note_id);
    let right = create(&conn, "Right", &parent.note.note_id);
    let shared = create(&conn, "Shared", &left.note.note_id);
    RelocationService::new(SqliteEntityStore::try_new(&conn).unwrap())
        .clone_note_to(&shared.note.note_id, &right.note.note_id)
        .unwrap();
    let outside = create(&conn, "Outside", ROOT_NOTE_ID);

    let service = protection(&conn, &session);
    let summary = service
        .protect_subtree(&parent.note.note_id, true)
        .unwrap();
    assert_eq!(
        summary,
        ProtectionSummary {
            visited: 4,
            changed: 4
        }
    );

    let store = service.store();
    for note_id in [
        &parent.note.note_id,
        &left.note.note_id,
        &right.note.note_id,
        &shared.note.note_id,
    ] {
        let note = store.get_note(note_id).unwrap().unwrap();
        assert!(note.is_protected, "{note_id} should be protected");
    }
    let shared_note = store.get_note(&shared.note.note_id).unwrap().unwrap();
    assert_ne!(shared_note.title, "Shared");
    assert_ne!(shared_note.content, b"Shared".to_vec());
    assert!(!store.get_note(&outside.note.note_id).unwrap().unwrap().is_protected);

    let again = service
        .protect_subtree(&parent.note.note_id, true)
        .unwrap();
    assert_eq!(again.changed, 0);
}

fn log_rows_containing(conn: &Connection, needle: &str) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM entity_changes WHERE payload LIKE '%' || ?1 || '%';",
        [needle],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn protect_subtree_leaves_no_plaintext_in_the_change_log() {
    let (conn, session) = setup();
    session.start(&conn, PASSPHRASE).unwrap();
    let replica = open_db_in_memory().unwrap();

    let secret = create(&conn, "TopSecretTitle", ROOT_NOTE_ID);
    let mut note = secret.note.clone();
    note.title = "TopSecretRenamed".to_string();
    SqliteEntityStore::try_new(&conn).unwrap().put_note(note).unwrap();
    let encoded_content = STANDARD.encode(b"TopSecretTitle");

    let apply_all = |from: &Connection, to: &Connection| {
        let target = ChangeLog::try_new(to).unwrap();
        for record in ChangeLog::try_new(from).unwrap().records_since(0).unwrap() {
            target.apply_incoming(&record).unwrap();
        }
    };
    apply_all(&conn, &replica);
    assert_eq!(log_rows_containing(&replica, "TopSecretTitle"), 1);

    protection(&conn, &session)
        .protect_subtree(&secret.note.note_id, true)
        .unwrap();
    apply_all(&conn, &replica);

    for db in [&conn, &replica] {
        assert_eq!(log_rows_containing(db, "TopSecretTitle"), 0);
        assert_eq!(log_rows_containing(db, "TopSecretRenamed"), 0);
        assert_eq!(log_rows_containing(db, &encoded_content), 0);
        let plaintext_rows: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM notes WHERE title LIKE '%TopSecret%';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(plaintext_rows, 0);
    }

    // Every rewritten record still replays into the same protected note.
    let fresh = open_db_in_memory().unwrap();
    apply_all(&conn, &fresh);
    let replayed = SqliteEntityStore::try_new(&fresh)
        .unwrap()
        .get_note(&secret.note.note_id)
        .unwrap()
        .unwrap();
    assert!(replayed.is_protected);
    assert_eq!(
        Some(replayed),
        SqliteEntityStore::try_new(&conn)
            .unwrap()
            .get_note(&secret.note.note_id)
            .unwrap()
    );
}

#[test]
fn unprotect_subtree_restores_plaintext() {
    let (conn, session) = setup();
    session.start(&conn, PASSPHRASE).unwrap();
    let parent = create(&conn, "Parent", ROOT_NOTE_ID);
    let child = create(&conn, "Child", &parent.note.note_id);

    let service = protection(&conn, &session);
    service.protect_subtree(&parent.note.note_id, true).unwrap();
    let summary = service
        .protect_subtree(&parent.note.note_id, false)
        .unwrap();
    assert_eq!(summary.changed, 2);

    let note = service
        .store()
        .get_note(&child.note.note_id)
        .unwrap()
        .unwrap();
    assert!(!note.is_protected);
    assert_eq!(note.title, "Child");
    assert_eq!(note.content, b"Child".to_vec());
}

#[test]
fn protect_subtree_of_missing_note_is_not_found() {
    let (conn, session) = setup();
    session.start(&conn, PASSPHRASE).unwrap();

    let err = protection(&conn, &session)
        .protect_subtree("ghost", true)
        .unwrap_err();
    assert!(matches!(err, ProtectionError::NotFound(ref id) if id == "ghost"));
}

#[test]
fn session_lifecycle_follows_password_and_logout() {
    let conn = open_db_in_memory().unwrap();
    let session = SessionManager::new(Duration::from_secs(600));
    assert!(!is_password_set(&conn).unwrap());
    assert!(matches!(
        session.start(&conn, PASSPHRASE),
        Err(SessionError::PasswordNotSet)
    ));

    setup_password(&conn, PASSPHRASE).unwrap();
    assert!(is_password_set(&conn).unwrap());
    assert!(matches!(
        session.start(&conn, "wrong"),
        Err(SessionError::WrongPassword)
    ));
    assert!(!session.is_available());

    session.start(&conn, PASSPHRASE).unwrap();
    assert!(session.is_available());
    let key = session.current_key().unwrap();

    change_password(&conn, PASSPHRASE, "new secret").unwrap();
    session.logout();
    assert!(matches!(session.current_key(), Err(SessionError::Unavailable)));
    session.start(&conn, "new secret").unwrap();
    assert_eq!(session.current_key().unwrap(), key);
}

#[test]
fn expired_session_is_unavailable() {
    let (conn, _) = setup();
    let session = Arc::new(SessionManager::new(Duration::from_millis(1)));
    session.start(&conn, PASSPHRASE).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let parent = create(&conn, "Parent", ROOT_NOTE_ID);
    let err = protection(&conn, &session)
        .protect_subtree(&parent.note.note_id, true)
        .unwrap_err();
    assert!(matches!(err, ProtectionError::SessionUnavailable));
    assert!(!session.touch());
}
