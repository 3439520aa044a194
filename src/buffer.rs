//! Backup buffering for messages sent while disconnected.
//!
//! The core only requires FIFO semantics and idempotent open/close; whether
//! entries survive a process restart is up to the implementation.
//! `MemoryBuffer` keeps the queue in memory; `SqliteBuffer` persists it.
//!
//! # Contract
//! - `write` is accepted in any phase, including before `open`.
//! - `drain` hands back the queued entries in write order and empties the
//!   queue; the driver replays them through the freshly opened transport
//!   before announcing `Connected`.

use crate::message::OutMessage;
use rusqlite::{Connection, params};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Trait + error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A FIFO of outbound messages held while the connection is down.
pub trait BackupBuffer: Send {
    /// Called on every transition into Open.  Idempotent.
    fn open(&mut self) -> Result<(), BufferError>;

    /// Called on the terminal transition into Closed.  Idempotent.
    fn close(&mut self) -> Result<(), BufferError>;

    /// Enqueue a message.  Accepted in any phase.
    fn write(&mut self, msg: OutMessage) -> Result<(), BufferError>;

    /// Remove and return everything queued so far, in write order.
    fn drain(&mut self) -> Result<Vec<OutMessage>, BufferError>;
}

// ---------------------------------------------------------------------------
// MemoryBuffer
// ---------------------------------------------------------------------------

/// In-memory FIFO; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBuffer {
    queue: VecDeque<OutMessage>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl BackupBuffer for MemoryBuffer {
    fn open(&mut self) -> Result<(), BufferError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), BufferError> {
        Ok(())
    }

    fn write(&mut self, msg: OutMessage) -> Result<(), BufferError> {
        self.queue.push_back(msg);
        Ok(())
    }

    fn drain(&mut self) -> Result<Vec<OutMessage>, BufferError> {
        Ok(self.queue.drain(..).collect())
    }
}

// ---------------------------------------------------------------------------
// SqliteBuffer
// ---------------------------------------------------------------------------

/// Durable FIFO backed by SQLite; queued messages survive process restarts.
///
/// Messages are stored as JSON rows ordered by rowid.  WAL keeps writes
/// cheap; synchronous=FULL keeps a crash from losing acknowledged writes.
pub struct SqliteBuffer {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteBuffer {
    /// Create a buffer persisting to `path`.  The database is opened lazily
    /// on first use.
    pub fn new(path: impl AsRef<Path>) -> Self {
        SqliteBuffer {
            path: path.as_ref().to_owned(),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut Connection, BufferError> {
        if self.conn.is_none() {
            let conn = Connection::open(&self.path)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=FULL;",
            )?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS backlog (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     payload TEXT NOT NULL
                 );",
            )?;
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().expect("connection opened above"))
    }
}

impl BackupBuffer for SqliteBuffer {
    fn open(&mut self) -> Result<(), BufferError> {
        self.conn().map(|_| ())
    }

    fn close(&mut self) -> Result<(), BufferError> {
        // Dropping the connection checkpoints the WAL; reopening is cheap.
        self.conn = None;
        Ok(())
    }

    fn write(&mut self, msg: OutMessage) -> Result<(), BufferError> {
        let payload = serde_json::to_string(&msg)?;
        self.conn()?.execute(
            "INSERT INTO backlog (payload) VALUES (?1)",
            params![payload],
        )?;
        Ok(())
    }

    fn drain(&mut self) -> Result<Vec<OutMessage>, BufferError> {
        let conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut messages = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT payload FROM backlog ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let payload = row?;
                match serde_json::from_str(&payload) {
                    Ok(msg) => messages.push(msg),
                    // A corrupt row must not wedge the replay of the rest.
                    Err(e) => warn!(error = %e, "skipping undecodable buffered message"),
                }
            }
            tx.execute("DELETE FROM backlog", [])?;
        }
        tx.commit()?;
        Ok(messages)
    }
}
