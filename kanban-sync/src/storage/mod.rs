//! Persistence contract for the board hierarchy.
//!
//! ```text
//! ┌────────────┐   run_atomic(unit)   ┌──────────────────────────────┐
//! │ Dispatcher │ ───────────────────► │ Store                        │
//! │ (handlers) │                      │  ├─ reads (committed state)  │
//! └────────────┘                      │  └─ Txn: reads + writes,     │
//!                                     │         staged, all-or-none  │
//!                                     └──────────────┬───────────────┘
//!                                                    │
//!                                                    ▼
//!                                      BoardStore (RocksDB WriteBatch)
//! ```
//!
//! Every read-modify-write over sibling positions runs inside one atomic
//! unit. Reads through a [`Txn`] observe that unit's staged writes.

pub mod rocks;

use std::cell::Cell;
use std::fmt;

use crate::model::{Board, EntityId, List, Note, Position};

pub use rocks::{BoardStore, StoreConfig};

/// Which table an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Board,
    List,
    Note,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Board => write!(f, "board"),
            EntityKind::List => write!(f, "list"),
            EntityKind::Note => write!(f, "note"),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Targeted entity does not exist (affected rows != 1)
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: EntityId },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Stored bytes violate the key or index layout
    #[error("Corrupted store: {0}")]
    Corrupted(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: EntityId) -> Self {
        StoreError::NotFound { kind, id }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Turn an affected-row count into a not-found error unless exactly one row changed.
pub fn expect_one(affected: usize, kind: EntityKind, id: EntityId) -> Result<(), StoreError> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::not_found(kind, id))
    }
}

/// Field-level note changes. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotePatch {
    pub text: Option<String>,
    /// Moves the note to another list.
    pub list_id: Option<EntityId>,
    pub raw: Option<bool>,
    pub minimized: Option<bool>,
}

impl NotePatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.list_id.is_none() && self.raw.is_none() && self.minimized.is_none()
    }
}

/// Read side of the store.
///
/// Ordered reads return children by position ascending, id ascending as the
/// tie breaker. Child collections on the returned entities are left empty.
pub trait StoreRead {
    fn boards(&self) -> Result<Vec<Board>, StoreError>;
    fn board(&self, id: EntityId) -> Result<Option<Board>, StoreError>;
    fn list(&self, id: EntityId) -> Result<Option<List>, StoreError>;
    fn note(&self, id: EntityId) -> Result<Option<Note>, StoreError>;
    fn lists_of(&self, board_id: EntityId) -> Result<Vec<List>, StoreError>;
    fn notes_of(&self, list_id: EntityId) -> Result<Vec<Note>, StoreError>;
}

/// An open atomic unit. Writes are staged and only become visible to other
/// readers when the unit commits.
///
/// Id-targeted updates and deletes return the number of affected rows.
pub trait Txn: StoreRead {
    fn create_board(&mut self, title: &str) -> Result<EntityId, StoreError>;
    fn rename_board(&mut self, id: EntityId, title: &str) -> Result<usize, StoreError>;
    /// Removes the board, its lists and their notes.
    fn delete_board(&mut self, id: EntityId) -> Result<usize, StoreError>;

    fn create_list(
        &mut self,
        board_id: EntityId,
        title: &str,
        position: Position,
    ) -> Result<EntityId, StoreError>;
    fn rename_list(&mut self, id: EntityId, title: &str) -> Result<usize, StoreError>;
    /// Removes the list and its notes.
    fn delete_list(&mut self, id: EntityId) -> Result<usize, StoreError>;
    fn set_list_position(&mut self, id: EntityId, position: Position) -> Result<usize, StoreError>;

    fn create_note(
        &mut self,
        list_id: EntityId,
        text: &str,
        position: Position,
    ) -> Result<EntityId, StoreError>;
    fn update_note_fields(&mut self, id: EntityId, patch: &NotePatch) -> Result<usize, StoreError>;
    fn set_note_position(&mut self, id: EntityId, position: Position) -> Result<usize, StoreError>;
    fn delete_note(&mut self, id: EntityId) -> Result<usize, StoreError>;
}

/// A shareable store.
///
/// `run_atomic` applies every write the unit staged, or none of them if the
/// unit returns an error. Units are serialized against each other, and
/// `on_commit` runs after a successful commit before the next unit may start.
pub trait Store: StoreRead + Send + Sync {
    fn run_atomic(
        &self,
        unit: &mut dyn FnMut(&mut dyn Txn) -> Result<(), StoreError>,
        on_commit: &mut dyn FnMut(),
    ) -> Result<(), StoreError>;
}

/// Value-returning wrappers over [`Store::run_atomic`].
pub trait StoreExt {
    fn atomic<T, F>(&self, unit: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<T, StoreError>,
    {
        self.commit_then(unit, |value| value)
    }

    /// Run `unit`, then hand its value to `publish` while units are still
    /// held off, so whatever `publish` emits follows commit order.
    fn commit_then<T, R, F, P>(&self, unit: F, publish: P) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<T, StoreError>,
        P: FnOnce(T) -> R;
}

impl<S: Store + ?Sized> StoreExt for S {
    fn commit_then<T, R, F, P>(&self, unit: F, publish: P) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<T, StoreError>,
        P: FnOnce(T) -> R,
    {
        let mut unit = Some(unit);
        let mut publish = Some(publish);
        let value = Cell::new(None);
        let mut published = None;
        self.run_atomic(
            &mut |txn| {
                let unit = unit
                    .take()
                    .ok_or_else(|| StoreError::Corrupted("atomic unit invoked twice".into()))?;
                value.set(Some(unit(txn)?));
                Ok(())
            },
            &mut || {
                if let (Some(publish), Some(value)) = (publish.take(), value.take()) {
                    published = Some(publish(value));
                }
            },
        )?;
        published.ok_or_else(|| StoreError::Corrupted("atomic unit produced no value".into()))
    }
}

/// Write dense positions for lists in the given order.
pub fn write_list_order(txn: &mut dyn Txn, order: &[EntityId]) -> Result<(), StoreError> {
    for (id, position) in crate::ordering::positions(order) {
        expect_one(txn.set_list_position(id, position)?, EntityKind::List, id)?;
    }
    Ok(())
}

/// Write dense positions for notes in the given order.
pub fn write_note_order(txn: &mut dyn Txn, order: &[EntityId]) -> Result<(), StoreError> {
    for (id, position) in crate::ordering::positions(order) {
        expect_one(txn.set_note_position(id, position)?, EntityKind::Note, id)?;
    }
    Ok(())
}
