//! Pull/push replication loop against one peer.
//!
//! # Responsibility
//! - Pull remote records after the persisted cursor and apply them.
//! - Push local records after the persisted push cursor.
//!
//! # Invariants
//! - Each pulled record is applied and its cursor advanced in one atomic
//!   unit, so a crash or cancel never leaves a batch half-applied.
//! - Cancellation is honored between batches only.
//! - Cursors only move forward; a restarted runner resumes where it stopped.

use crate::model::change::{ChangeLogRecord, SequenceId};
use crate::repo::entity_store::StoreError;
use crate::repo::sync_cursor_repo::{load_cursor, save_pulled, save_pushed, SyncCursor};
use crate::repo::write_scope::with_write_scope;
use crate::sync::change_log::{ApplyOutcome, ChangeLog, ChangeLogError};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default number of records per pull/push request.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Error reported by a transport; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error [{}]: {}", self.code, self.message)
    }
}

impl Error for TransportError {}

/// Moves change records between this instance and one peer.
pub trait SyncTransport {
    /// Stable peer identifier used to key persisted cursors.
    fn peer_id(&self) -> &str;
    /// Peer records with `sequence_id > after`, ascending, at most `limit`.
    fn pull(&self, after: SequenceId, limit: u32) -> Result<Vec<ChangeLogRecord>, TransportError>;
    /// Hands local records to the peer for `apply_incoming`.
    fn push(&self, records: &[ChangeLogRecord]) -> Result<(), TransportError>;
}

/// Cooperative cancellation shared between a runner and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub rejected: usize,
    /// Branches dropped because an end note is erased locally.
    pub dangling: usize,
    pub pushed: usize,
    pub cancelled: bool,
    pub cursor: SyncCursor,
}

#[derive(Debug)]
pub enum SyncError {
    Transport(TransportError),
    ChangeLog(ChangeLogError),
}

impl SyncError {
    pub fn code(&self) -> &str {
        match self {
            Self::Transport(err) => err.code.as_str(),
            Self::ChangeLog(ChangeLogError::InvalidRecord(_)) => "invalid_record",
            Self::ChangeLog(ChangeLogError::Storage(_)) => "storage_failed",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.retryable,
            Self::ChangeLog(_) => false,
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::ChangeLog(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::ChangeLog(err) => Some(err),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<ChangeLogError> for SyncError {
    fn from(value: ChangeLogError) -> Self {
        Self::ChangeLog(value)
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::ChangeLog(value.into())
    }
}

/// Replication loop for one peer.
pub struct SyncRunner<'conn, T: SyncTransport> {
    log: ChangeLog<'conn>,
    transport: T,
    batch_size: u32,
    cancel: CancelFlag,
}

impl<'conn, T: SyncTransport> SyncRunner<'conn, T> {
    pub fn new(log: ChangeLog<'conn>, transport: T) -> Self {
        Self {
            log,
            transport,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: CancelFlag::new(),
        }
    }

    /// Sets the per-request record limit; `0` is treated as `1`.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Persisted progress with this runner's peer.
    pub fn cursor(&self) -> Result<SyncCursor, SyncError> {
        Ok(load_cursor(self.log.connection(), self.transport.peer_id())?)
    }

    /// Pulls until the peer is drained, then pushes until this log is drained.
    pub fn run_once(&self) -> Result<SyncReport, SyncError> {
        let started_at = Instant::now();
        let peer_id = self.transport.peer_id();
        info!("event=sync_run module=sync status=start peer_id={peer_id}");

        let mut report = SyncReport::default();
        let result = self
            .pull_all(&mut report)
            .and_then(|()| self.push_all(&mut report))
            .and_then(|()| self.cursor());

        match result {
            Ok(cursor) => {
                report.cursor = cursor;
                info!(
                    "event=sync_run module=sync status=ok peer_id={} pulled={} applied={} stale={} rejected={} dangling={} pushed={} cancelled={} duration_ms={}",
                    peer_id,
                    report.pulled,
                    report.applied,
                    report.stale,
                    report.rejected,
                    report.dangling,
                    report.pushed,
                    report.cancelled,
                    started_at.elapsed().as_millis()
                );
                Ok(report)
            }
            Err(err) => {
                warn!(
                    "event=sync_run module=sync status=error peer_id={} duration_ms={} error_code={} retryable={}",
                    peer_id,
                    started_at.elapsed().as_millis(),
                    err.code(),
                    err.is_retryable()
                );
                Err(err)
            }
        }
    }

    fn pull_all(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let conn = self.log.connection();
        let peer_id = self.transport.peer_id();
        let mut after = load_cursor(conn, peer_id)?.last_pulled;

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let batch = self.transport.pull(after, self.batch_size)?;
            let batch_len = batch.len();

            for record in &batch {
                let outcome = with_write_scope::<_, SyncError, _>(conn, || {
                    let outcome = self.log.apply_incoming(record)?;
                    save_pulled(conn, peer_id, record.sequence_id)?;
                    Ok(outcome)
                })?;
                report.pulled += 1;
                match outcome {
                    ApplyOutcome::Applied => report.applied += 1,
                    ApplyOutcome::Duplicate => report.duplicates += 1,
                    ApplyOutcome::Stale => report.stale += 1,
                    ApplyOutcome::Dangling => report.dangling += 1,
                    ApplyOutcome::Rejected(violation) => {
                        report.rejected += 1;
                        warn!(
                            "event=change_apply module=sync status=rejected peer_id={} entity_id={} error_code={}",
                            peer_id,
                            record.entity_id,
                            violation.code()
                        );
                    }
                }
                after = after.max(record.sequence_id);
            }

            if batch_len < self.batch_size as usize {
                return Ok(());
            }
        }
    }

    fn push_all(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let conn = self.log.connection();
        let peer_id = self.transport.peer_id();
        let mut after = load_cursor(conn, peer_id)?.last_pushed;

        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let batch = self.log.records_page(after, self.batch_size)?;
            let Some(last) = batch.last().map(|record| record.sequence_id) else {
                return Ok(());
            };

            self.transport.push(&batch)?;
            save_pushed(conn, peer_id, last)?;
            report.pushed += batch.len();
            after = last;

            if batch.len() < self.batch_size as usize {
                return Ok(());
            }
        }
    }
}
