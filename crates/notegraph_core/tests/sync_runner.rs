use notegraph_core::db::open_db_in_memory;
use notegraph_core::{
    CancelFlag, ChangeLog, ChangeLogRecord, GraphSnapshot, NewNote, Placement,
    RelocationService, SequenceId, SqliteEntityStore, SyncCursor, SyncError, SyncRunner,
    SyncTransport, TransportError, ROOT_NOTE_ID,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Transport talking straight to another in-process database.
struct PeerTransport {
    peer_id: String,
    peer: Arc<Mutex<Connection>>,
    fail_after_pulls: Option<usize>,
    pulls: AtomicUsize,
}

impl PeerTransport {
    fn new(peer: Arc<Mutex<Connection>>) -> Self {
        let peer_id = {
            let conn = peer.lock();
            ChangeLog::try_new(&conn).unwrap().source_id().to_string()
        };
        Self {
            peer_id,
            peer,
            fail_after_pulls: None,
            pulls: AtomicUsize::new(0),
        }
    }

    fn failing_after(mut self, pulls: usize) -> Self {
        self.fail_after_pulls = Some(pulls);
        self
    }
}

impl SyncTransport for PeerTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn pull(&self, after: SequenceId, limit: u32) -> Result<Vec<ChangeLogRecord>, TransportError> {
        let done = self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after_pulls.is_some_and(|budget| done >= budget) {
            return Err(TransportError::new("peer_unreachable", "connection reset", true));
        }
        let conn = self.peer.lock();
        let log = ChangeLog::try_new(&conn)
            .map_err(|err| TransportError::new("peer_failed", err.to_string(), false))?;
        log.records_page(after, limit)
            .map_err(|err| TransportError::new("peer_failed", err.to_string(), false))
    }

    fn push(&self, records: &[ChangeLogRecord]) -> Result<(), TransportError> {
        let conn = self.peer.lock();
        let log = ChangeLog::try_new(&conn)
            .map_err(|err| TransportError::new("peer_failed", err.to_string(), false))?;
        for record in records {
            log.apply_incoming(record)
                .map_err(|err| TransportError::new("peer_failed", err.to_string(), false))?;
        }
        Ok(())
    }
}

fn create_notes(conn: &Connection, titles: &[&str]) {
    let service = RelocationService::new(SqliteEntityStore::try_new(conn).unwrap());
    for title in titles {
        service
            .create_note(NewNote::text(*title), Placement::Into(ROOT_NOTE_ID.to_string()))
            .unwrap();
    }
}

fn last_sequence_id(conn: &Connection) -> SequenceId {
    ChangeLog::try_new(conn).unwrap().last_sequence_id().unwrap()
}

#[test]
fn run_once_pulls_remote_changes_and_pushes_local_log() {
    let local = open_db_in_memory().unwrap();
    let peer = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
    create_notes(&peer.lock(), &["One", "Two"]);
    let peer_records = last_sequence_id(&peer.lock());

    let runner = SyncRunner::new(
        ChangeLog::try_new(&local).unwrap(),
        PeerTransport::new(peer.clone()),
    );
    let report = runner.run_once().unwrap();

    assert_eq!(report.pulled, 4);
    assert_eq!(report.applied, 4);
    assert_eq!(report.pushed, 4);
    assert!(!report.cancelled);
    assert_eq!(
        report.cursor,
        SyncCursor {
            last_pulled: peer_records,
            last_pushed: last_sequence_id(&local),
        }
    );
    assert_eq!(
        GraphSnapshot::load(&local).unwrap(),
        GraphSnapshot::load(&peer.lock()).unwrap()
    );
    // Echoes of the peer's own records are ignored there.
    assert_eq!(last_sequence_id(&peer.lock()), peer_records);

    let second = runner.run_once().unwrap();
    assert_eq!(second.pulled, 0);
    assert_eq!(second.pushed, 0);
    assert_eq!(second.cursor, report.cursor);
}

#[test]
fn two_sided_edits_converge() {
    let local = open_db_in_memory().unwrap();
    let peer = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
    create_notes(&local, &["Folder"]);

    let runner = SyncRunner::new(
        ChangeLog::try_new(&local).unwrap(),
        PeerTransport::new(peer.clone()),
    )
    .with_batch_size(3);
    runner.run_once().unwrap();

    let folder_id = {
        let snapshot = GraphSnapshot::load(&peer.lock()).unwrap();
        snapshot.children(ROOT_NOTE_ID)[0].note_id.clone()
    };
    create_notes(&local, &["Local note"]);
    RelocationService::new(SqliteEntityStore::try_new(&peer.lock()).unwrap())
        .create_note(NewNote::text("Peer note"), Placement::Into(folder_id.clone()))
        .unwrap();

    let report = runner.run_once().unwrap();
    assert_eq!(report.rejected, 0);
    assert_eq!(report.stale, 0);

    let local_snapshot = GraphSnapshot::load(&local).unwrap();
    assert_eq!(local_snapshot, GraphSnapshot::load(&peer.lock()).unwrap());
    assert_eq!(local_snapshot.children(ROOT_NOTE_ID).len(), 2);
    assert_eq!(local_snapshot.children(&folder_id).len(), 1);
}

#[test]
fn cancelled_runner_stops_before_the_next_batch() {
    let local = open_db_in_memory().unwrap();
    let peer = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
    create_notes(&peer.lock(), &["One"]);

    let cancel = CancelFlag::new();
    let runner = SyncRunner::new(
        ChangeLog::try_new(&local).unwrap(),
        PeerTransport::new(peer.clone()),
    )
    .with_cancel_flag(cancel.clone());
    cancel.cancel();

    let report = runner.run_once().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.pulled, 0);
    assert_eq!(report.cursor, SyncCursor::default());
    assert_eq!(last_sequence_id(&local), 0);
}

#[test]
fn interrupted_pull_resumes_from_persisted_cursor() {
    let local = open_db_in_memory().unwrap();
    let peer = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
    create_notes(&peer.lock(), &["One", "Two", "Three"]);
    let peer_records = last_sequence_id(&peer.lock());

    let flaky = SyncRunner::new(
        ChangeLog::try_new(&local).unwrap(),
        PeerTransport::new(peer.clone()).failing_after(1),
    )
    .with_batch_size(2);
    let err = flaky.run_once().unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(err.is_retryable());
    assert_eq!(err.code(), "peer_unreachable");
    assert_eq!(flaky.cursor().unwrap().last_pulled, 2);
    assert_eq!(last_sequence_id(&local), 2);

    let runner = SyncRunner::new(
        ChangeLog::try_new(&local).unwrap(),
        PeerTransport::new(peer.clone()),
    )
    .with_batch_size(2);
    let report = runner.run_once().unwrap();
    assert_eq!(report.pulled as i64, peer_records - 2);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.cursor.last_pulled, peer_records);
    assert_eq!(
        GraphSnapshot::load(&local).unwrap(),
        GraphSnapshot::load(&peer.lock()).unwrap()
    );
}
