//! RocksDB-backed board store.
//!
//! Column families:
//! - `boards`      : `board_id` → [`BoardRecord`]
//! - `lists`       : `list_id` → [`ListRecord`]
//! - `notes`       : `note_id` → [`NoteRecord`]
//! - `board_lists` : `board_id ++ list_id` → empty (child index)
//! - `list_notes`  : `list_id ++ note_id` → empty (child index)
//! - `meta`        : `next_<kind>` → next free id, big-endian
//!
//! Ids are 8-byte big-endian so that key order is id order and the last key
//! of an entity family is its highest id. Records are bincode-encoded.
//!
//! An atomic unit stages its writes in an in-memory overlay that its own
//! reads consult first, then commits them as a single `WriteBatch`. Units
//! are serialized by a writer lock, which makes positions under a parent a
//! serialized resource.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{EntityKind, NotePatch, Store, StoreError, StoreRead, Txn};
use crate::model::{Board, EntityId, List, Note, Position};

const CF_BOARDS: &str = "boards";
const CF_LISTS: &str = "lists";
const CF_NOTES: &str = "notes";
const CF_BOARD_LISTS: &str = "board_lists";
const CF_LIST_NOTES: &str = "list_notes";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_BOARDS, CF_LISTS, CF_NOTES, CF_BOARD_LISTS, CF_LIST_NOTES, CF_META];

const ID_LEN: usize = 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every committed unit (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kanban_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BoardRecord {
    title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ListRecord {
    board_id: EntityId,
    title: String,
    position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NoteRecord {
    list_id: EntityId,
    text: String,
    raw: bool,
    minimized: bool,
    position: Position,
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

fn id_key(id: EntityId) -> [u8; ID_LEN] {
    id.get().to_be_bytes()
}

/// `parent ++ child`, used by both index families.
fn child_key(parent: EntityId, child: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN * 2);
    key.extend_from_slice(&id_key(parent));
    key.extend_from_slice(&id_key(child));
    key
}

fn read_id(bytes: &[u8]) -> Result<EntityId, StoreError> {
    let buf: [u8; ID_LEN] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupted(format!("expected {ID_LEN}-byte id, got {} bytes", bytes.len())))?;
    Ok(EntityId(u64::from_be_bytes(buf)))
}

fn entity_family(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Board => CF_BOARDS,
        EntityKind::List => CF_LISTS,
        EntityKind::Note => CF_NOTES,
    }
}

fn counter_key(kind: EntityKind) -> String {
    format!("next_{kind}")
}

/// Next free id for every entity kind.
#[derive(Debug, Clone, Copy)]
struct NextIds {
    board: u64,
    list: u64,
    note: u64,
}

impl NextIds {
    fn take(&mut self, kind: EntityKind) -> EntityId {
        let slot = match kind {
            EntityKind::Board => &mut self.board,
            EntityKind::List => &mut self.list,
            EntityKind::Note => &mut self.note,
        };
        let id = *slot;
        *slot += 1;
        EntityId(id)
    }
}

/// RocksDB-backed store for boards, lists and notes.
pub struct BoardStore {
    /// RocksDB instance (single-threaded mode, concurrency via the writer lock)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    next_board: AtomicU64,
    next_list: AtomicU64,
    next_note: AtomicU64,
    /// Serializes atomic units.
    writer: Mutex<()>,
}

impl BoardStore {
    /// Open the store at the configured path, creating it if needed.
    ///
    /// Id counters resume after the highest stored id of each kind.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_board = Self::recover_next_id(&db, EntityKind::Board)?;
        let next_list = Self::recover_next_id(&db, EntityKind::List)?;
        let next_note = Self::recover_next_id(&db, EntityKind::Note)?;
        log::info!(
            "Opened board store at {} (next ids: board={next_board}, list={next_list}, note={next_note})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_board: AtomicU64::new(next_board),
            next_list: AtomicU64::new(next_list),
            next_note: AtomicU64::new(next_note),
            writer: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_BOARD_LISTS | CF_LIST_NOTES => {
                // Always scanned by parent id
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(ID_LEN));
            }
            _ => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    /// Next free id for `kind`.
    ///
    /// The persisted counter wins, so ids of deleted entities are never handed
    /// out again. Stores written without a counter fall back to the highest
    /// stored id + 1.
    fn recover_next_id(db: &DBWithThreadMode<SingleThreaded>, kind: EntityKind) -> Result<u64, StoreError> {
        let family = |name: &str| {
            db.cf_handle(name)
                .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
        };

        let mut iter = db.iterator_cf(family(entity_family(kind))?, IteratorMode::End);
        let after_highest = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                read_id(&key)?.get() + 1
            }
            None => 1,
        };

        let persisted = match db.get_cf(family(CF_META)?, counter_key(kind))? {
            Some(bytes) => read_id(&bytes)?.get(),
            None => 1,
        };

        Ok(after_highest.max(persisted))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn next_ids(&self) -> NextIds {
        NextIds {
            board: self.next_board.load(Ordering::SeqCst),
            list: self.next_list.load(Ordering::SeqCst),
            note: self.next_note.load(Ordering::SeqCst),
        }
    }

    /// Read view over committed state.
    fn view(&self) -> Unit<'_> {
        Unit::new(self)
    }

    /// Apply a unit's overlay as one batch.
    fn commit(&self, unit: Unit<'_>) -> Result<(), StoreError> {
        if unit.staged.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        let mut writes = 0usize;
        for (name, entries) in &unit.staged {
            let cf = self.cf(name)?;
            for (key, value) in entries {
                match value {
                    Some(value) => batch.put_cf(cf, key, value),
                    None => batch.delete_cf(cf, key),
                }
                writes += 1;
            }
        }

        let meta = self.cf(CF_META)?;
        let before = self.next_ids();
        for (kind, was, now) in [
            (EntityKind::Board, before.board, unit.next_ids.board),
            (EntityKind::List, before.list, unit.next_ids.list),
            (EntityKind::Note, before.note, unit.next_ids.note),
        ] {
            if now != was {
                batch.put_cf(meta, counter_key(kind), now.to_be_bytes());
                writes += 1;
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.next_board.store(unit.next_ids.board, Ordering::SeqCst);
        self.next_list.store(unit.next_ids.list, Ordering::SeqCst);
        self.next_note.store(unit.next_ids.note, Ordering::SeqCst);

        log::trace!("Committed atomic unit ({writes} writes)");
        Ok(())
    }
}

impl Store for BoardStore {
    fn run_atomic(
        &self,
        unit: &mut dyn FnMut(&mut dyn Txn) -> Result<(), StoreError>,
        on_commit: &mut dyn FnMut(),
    ) -> Result<(), StoreError> {
        // A poisoned lock only means another unit panicked; its overlay was never written.
        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut staged = Unit::new(self);
        if let Err(e) = unit(&mut staged) {
            log::debug!("Atomic unit rolled back: {e}");
            return Err(e);
        }
        self.commit(staged)?;
        on_commit();
        Ok(())
    }
}

impl StoreRead for BoardStore {
    fn boards(&self) -> Result<Vec<Board>, StoreError> {
        self.view().boards()
    }

    fn board(&self, id: EntityId) -> Result<Option<Board>, StoreError> {
        self.view().board(id)
    }

    fn list(&self, id: EntityId) -> Result<Option<List>, StoreError> {
        self.view().list(id)
    }

    fn note(&self, id: EntityId) -> Result<Option<Note>, StoreError> {
        self.view().note(id)
    }

    fn lists_of(&self, board_id: EntityId) -> Result<Vec<List>, StoreError> {
        self.view().lists_of(board_id)
    }

    fn notes_of(&self, list_id: EntityId) -> Result<Vec<Note>, StoreError> {
        self.view().notes_of(list_id)
    }
}

// ─── Atomic units ─────────────────────────────────────────────────────

/// Staged writes over committed state. `None` marks a staged delete.
struct Unit<'a> {
    store: &'a BoardStore,
    staged: HashMap<&'static str, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    next_ids: NextIds,
}

impl<'a> Unit<'a> {
    fn new(store: &'a BoardStore) -> Self {
        Self {
            store,
            staged: HashMap::new(),
            next_ids: store.next_ids(),
        }
    }

    fn get(&self, name: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(staged) = self.staged.get(name).and_then(|entries| entries.get(key)) {
            return Ok(staged.clone());
        }
        let cf = self.store.cf(name)?;
        Ok(self.store.db.get_cf(cf, key)?)
    }

    /// Every live `(key, value)` whose key starts with `prefix`, in key order.
    fn scan(&self, name: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.store.cf(name)?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        let iter = if prefix.is_empty() {
            self.store.db.iterator_cf(cf, IteratorMode::Start)
        } else {
            self.store.db.prefix_iterator_cf(cf, prefix)
        };
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            merged.insert(key.to_vec(), value.to_vec());
        }

        if let Some(entries) = self.staged.get(name) {
            for (key, value) in entries.range(prefix.to_vec()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                match value {
                    Some(value) => merged.insert(key.clone(), value.clone()),
                    None => merged.remove(key),
                };
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn put(&mut self, name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.staged.entry(name).or_default().insert(key, Some(value));
    }

    fn delete(&mut self, name: &'static str, key: Vec<u8>) {
        self.staged.entry(name).or_default().insert(key, None);
    }

    fn child_ids(&self, index: &'static str, parent: EntityId) -> Result<Vec<EntityId>, StoreError> {
        self.scan(index, &id_key(parent))?
            .into_iter()
            .map(|(key, _)| read_id(&key[ID_LEN..]))
            .collect()
    }

    fn board_record(&self, id: EntityId) -> Result<Option<BoardRecord>, StoreError> {
        self.get(CF_BOARDS, &id_key(id))?.map(|b| decode(&b)).transpose()
    }

    fn list_record(&self, id: EntityId) -> Result<Option<ListRecord>, StoreError> {
        self.get(CF_LISTS, &id_key(id))?.map(|b| decode(&b)).transpose()
    }

    fn note_record(&self, id: EntityId) -> Result<Option<NoteRecord>, StoreError> {
        self.get(CF_NOTES, &id_key(id))?.map(|b| decode(&b)).transpose()
    }

    fn put_board(&mut self, id: EntityId, record: &BoardRecord) -> Result<(), StoreError> {
        self.put(CF_BOARDS, id_key(id).to_vec(), encode(record)?);
        Ok(())
    }

    fn put_list(&mut self, id: EntityId, record: &ListRecord) -> Result<(), StoreError> {
        self.put(CF_LISTS, id_key(id).to_vec(), encode(record)?);
        Ok(())
    }

    fn put_note(&mut self, id: EntityId, record: &NoteRecord) -> Result<(), StoreError> {
        self.put(CF_NOTES, id_key(id).to_vec(), encode(record)?);
        Ok(())
    }

    fn remove_note(&mut self, id: EntityId, record: &NoteRecord) {
        self.delete(CF_LIST_NOTES, child_key(record.list_id, id));
        self.delete(CF_NOTES, id_key(id).to_vec());
    }

    fn remove_list(&mut self, id: EntityId, record: &ListRecord) -> Result<(), StoreError> {
        for note_id in self.child_ids(CF_LIST_NOTES, id)? {
            if let Some(note) = self.note_record(note_id)? {
                self.remove_note(note_id, &note);
            } else {
                self.delete(CF_LIST_NOTES, child_key(id, note_id));
            }
        }
        self.delete(CF_BOARD_LISTS, child_key(record.board_id, id));
        self.delete(CF_LISTS, id_key(id).to_vec());
        Ok(())
    }
}

fn to_list(id: EntityId, record: ListRecord) -> List {
    List {
        id,
        board_id: record.board_id,
        title: record.title,
        position: record.position,
        notes: Vec::new(),
    }
}

fn to_note(id: EntityId, record: NoteRecord) -> Note {
    Note {
        id,
        list_id: record.list_id,
        minimized: record.minimized,
        raw: record.raw,
        text: record.text,
        position: record.position,
    }
}

impl StoreRead for Unit<'_> {
    fn boards(&self) -> Result<Vec<Board>, StoreError> {
        self.scan(CF_BOARDS, &[])?
            .into_iter()
            .map(|(key, value)| {
                let record: BoardRecord = decode(&value)?;
                Ok(Board {
                    id: read_id(&key)?,
                    title: record.title,
                    lists: Vec::new(),
                })
            })
            .collect()
    }

    fn board(&self, id: EntityId) -> Result<Option<Board>, StoreError> {
        Ok(self.board_record(id)?.map(|record| Board {
            id,
            title: record.title,
            lists: Vec::new(),
        }))
    }

    fn list(&self, id: EntityId) -> Result<Option<List>, StoreError> {
        Ok(self.list_record(id)?.map(|record| to_list(id, record)))
    }

    fn note(&self, id: EntityId) -> Result<Option<Note>, StoreError> {
        Ok(self.note_record(id)?.map(|record| to_note(id, record)))
    }

    fn lists_of(&self, board_id: EntityId) -> Result<Vec<List>, StoreError> {
        let mut lists = Vec::new();
        for id in self.child_ids(CF_BOARD_LISTS, board_id)? {
            let record = self
                .list_record(id)?
                .ok_or_else(|| StoreError::Corrupted(format!("board {board_id} indexes missing list {id}")))?;
            lists.push(to_list(id, record));
        }
        lists.sort_by_key(|list| (list.position, list.id));
        Ok(lists)
    }

    fn notes_of(&self, list_id: EntityId) -> Result<Vec<Note>, StoreError> {
        let mut notes = Vec::new();
        for id in self.child_ids(CF_LIST_NOTES, list_id)? {
            let record = self
                .note_record(id)?
                .ok_or_else(|| StoreError::Corrupted(format!("list {list_id} indexes missing note {id}")))?;
            notes.push(to_note(id, record));
        }
        notes.sort_by_key(|note| (note.position, note.id));
        Ok(notes)
    }
}

impl Txn for Unit<'_> {
    fn create_board(&mut self, title: &str) -> Result<EntityId, StoreError> {
        let id = self.next_ids.take(EntityKind::Board);
        self.put_board(id, &BoardRecord { title: title.to_string() })?;
        Ok(id)
    }

    fn rename_board(&mut self, id: EntityId, title: &str) -> Result<usize, StoreError> {
        let Some(mut record) = self.board_record(id)? else {
            return Ok(0);
        };
        record.title = title.to_string();
        self.put_board(id, &record)?;
        Ok(1)
    }

    fn delete_board(&mut self, id: EntityId) -> Result<usize, StoreError> {
        if self.board_record(id)?.is_none() {
            return Ok(0);
        }
        for list_id in self.child_ids(CF_BOARD_LISTS, id)? {
            match self.list_record(list_id)? {
                Some(list) => self.remove_list(list_id, &list)?,
                None => self.delete(CF_BOARD_LISTS, child_key(id, list_id)),
            }
        }
        self.delete(CF_BOARDS, id_key(id).to_vec());
        Ok(1)
    }

    fn create_list(
        &mut self,
        board_id: EntityId,
        title: &str,
        position: Position,
    ) -> Result<EntityId, StoreError> {
        if self.board_record(board_id)?.is_none() {
            return Err(StoreError::not_found(EntityKind::Board, board_id));
        }
        let id = self.next_ids.take(EntityKind::List);
        self.put_list(
            id,
            &ListRecord {
                board_id,
                title: title.to_string(),
                position,
            },
        )?;
        self.put(CF_BOARD_LISTS, child_key(board_id, id), Vec::new());
        Ok(id)
    }

    fn rename_list(&mut self, id: EntityId, title: &str) -> Result<usize, StoreError> {
        let Some(mut record) = self.list_record(id)? else {
            return Ok(0);
        };
        record.title = title.to_string();
        self.put_list(id, &record)?;
        Ok(1)
    }

    fn delete_list(&mut self, id: EntityId) -> Result<usize, StoreError> {
        let Some(record) = self.list_record(id)? else {
            return Ok(0);
        };
        self.remove_list(id, &record)?;
        Ok(1)
    }

    fn set_list_position(&mut self, id: EntityId, position: Position) -> Result<usize, StoreError> {
        let Some(mut record) = self.list_record(id)? else {
            return Ok(0);
        };
        if record.position != position {
            record.position = position;
            self.put_list(id, &record)?;
        }
        Ok(1)
    }

    fn create_note(
        &mut self,
        list_id: EntityId,
        text: &str,
        position: Position,
    ) -> Result<EntityId, StoreError> {
        if self.list_record(list_id)?.is_none() {
            return Err(StoreError::not_found(EntityKind::List, list_id));
        }
        let id = self.next_ids.take(EntityKind::Note);
        self.put_note(
            id,
            &NoteRecord {
                list_id,
                text: text.to_string(),
                raw: false,
                minimized: false,
                position,
            },
        )?;
        self.put(CF_LIST_NOTES, child_key(list_id, id), Vec::new());
        Ok(id)
    }

    fn update_note_fields(&mut self, id: EntityId, patch: &NotePatch) -> Result<usize, StoreError> {
        let Some(mut record) = self.note_record(id)? else {
            return Ok(0);
        };

        if let Some(list_id) = patch.list_id.filter(|list_id| *list_id != record.list_id) {
            if self.list_record(list_id)?.is_none() {
                return Err(StoreError::not_found(EntityKind::List, list_id));
            }
            self.delete(CF_LIST_NOTES, child_key(record.list_id, id));
            self.put(CF_LIST_NOTES, child_key(list_id, id), Vec::new());
            record.list_id = list_id;
        }
        if let Some(text) = &patch.text {
            record.text = text.clone();
        }
        if let Some(raw) = patch.raw {
            record.raw = raw;
        }
        if let Some(minimized) = patch.minimized {
            record.minimized = minimized;
        }

        self.put_note(id, &record)?;
        Ok(1)
    }

    fn set_note_position(&mut self, id: EntityId, position: Position) -> Result<usize, StoreError> {
        let Some(mut record) = self.note_record(id)? else {
            return Ok(0);
        };
        if record.position != position {
            record.position = position;
            self.put_note(id, &record)?;
        }
        Ok(1)
    }

    fn delete_note(&mut self, id: EntityId) -> Result<usize, StoreError> {
        let Some(record) = self.note_record(id)? else {
            return Ok(0);
        };
        self.remove_note(id, &record);
        Ok(1)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
