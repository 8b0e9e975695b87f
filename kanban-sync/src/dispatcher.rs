//! Routes decoded commands to their handlers.
//!
//! ```text
//! frame ─► Inbound::decode ─┬─ Empty ─────────► (ignored)
//!                           ├─ Unsupported ───► Error event to origin
//!                           └─ Command ───────► handler ─► Store ─► Fanout
//! ```

use std::sync::Arc;

use crate::broadcast::{ConnectionId, Fanout};
use crate::error::SyncError;
use crate::handlers::{self, Context};
use crate::protocol::{Command, Event, Inbound};
use crate::storage::Store;

/// Shared command processor. Cheap to clone into connection tasks.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    fanout: Fanout,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, fanout: Fanout) -> Self {
        Self { store, fanout }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    /// Process one inbound text frame from `origin`.
    pub fn dispatch(&self, origin: ConnectionId, frame: &str) -> Result<(), SyncError> {
        let inbound = Inbound::decode(frame)?;
        self.route(origin, inbound)
    }

    /// Process one inbound binary frame, read as UTF-8 text.
    pub fn dispatch_bytes(&self, origin: ConnectionId, frame: &[u8]) -> Result<(), SyncError> {
        let inbound = Inbound::decode_bytes(frame)?;
        self.route(origin, inbound)
    }

    fn route(&self, origin: ConnectionId, inbound: Inbound) -> Result<(), SyncError> {
        match inbound {
            Inbound::Empty => Ok(()),
            Inbound::Unsupported(name) => {
                log::warn!("Unsupported command {name:?} from {origin}");
                self.fanout.send_to(origin, &Event::not_supported())?;
                Ok(())
            }
            Inbound::Command(command) => self.execute(origin, command),
        }
    }

    /// Run an already decoded command.
    pub fn execute(&self, origin: ConnectionId, command: Command) -> Result<(), SyncError> {
        log::debug!("{} from {origin}", command.name());
        let ctx = Context {
            store: self.store.as_ref(),
            fanout: &self.fanout,
            origin,
        };

        match command {
            Command::GetBoardList => handlers::get_board_list(&ctx),
            Command::GetBoard(target) => handlers::get_board(&ctx, target),
            Command::AddBoard(request) => handlers::add_board(&ctx, request),
            Command::DeleteBoard(target) => handlers::delete_board(&ctx, target),
            Command::EditBoard(request) => handlers::edit_board(&ctx, request),
            Command::AddList(request) => handlers::add_list(&ctx, request),
            Command::DeleteList(target) => handlers::delete_list(&ctx, target),
            Command::EditList(request) => handlers::edit_list(&ctx, request),
            Command::MoveList(request) => handlers::move_list(&ctx, request),
            Command::AddNote(request) => handlers::add_note(&ctx, request),
            Command::DeleteNote(target) => handlers::delete_note(&ctx, target),
            Command::EditNote(request) => handlers::edit_note(&ctx, request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{ConnectionRegistry, Outbox, Registry};
    use crate::model::{Board, EntityId, List, Note};
    use crate::protocol::{COMMAND_NOT_SUPPORTED, ProtocolError};
    use crate::storage::{BoardStore, EntityKind, StoreConfig, StoreError, StoreRead, Txn};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<BoardStore>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(BoardStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
            let registry = Arc::new(ConnectionRegistry::new());
            let dispatcher = Dispatcher::new(store.clone(), Fanout::new(registry.clone()));
            Self {
                _dir: dir,
                store,
                registry,
                dispatcher,
            }
        }

        fn connect(&self) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
            self.connect_with(64)
        }

        fn connect_with(&self, capacity: usize) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
            let (outbox, rx) = Outbox::channel(capacity);
            (self.registry.register(outbox), rx)
        }

        fn send(&self, origin: ConnectionId, envelope: serde_json::Value) -> Result<(), SyncError> {
            self.dispatcher.dispatch(origin, &envelope.to_string())
        }

        fn board_with_lists(&self, origin: ConnectionId, titles: &[&str]) -> (EntityId, Vec<EntityId>) {
            self.send(origin, json!({"command": "ADD_BOARD", "data": {"title": "Board"}}))
                .unwrap();
            let board = self.store.boards().unwrap().last().unwrap().id;
            for title in titles {
                self.send(
                    origin,
                    json!({"command": "ADD_LIST", "data": {"board_id": board.to_string(), "title": title}}),
                )
                .unwrap();
            }
            let lists = self.list_order(board);
            (board, lists)
        }

        fn notes(&self, origin: ConnectionId, list: EntityId, count: usize) -> Vec<EntityId> {
            for i in 0..count {
                self.send(
                    origin,
                    json!({"command": "ADD_NOTE", "data": {"list_id": list.to_string(), "text": format!("n{i}")}}),
                )
                .unwrap();
            }
            self.note_order(list)
        }

        fn list_order(&self, board: EntityId) -> Vec<EntityId> {
            let lists: Vec<List> = self.store.lists_of(board).unwrap();
            assert_dense(lists.iter().map(|l| l.position));
            lists.into_iter().map(|l| l.id).collect()
        }

        fn note_order(&self, list: EntityId) -> Vec<EntityId> {
            let notes: Vec<Note> = self.store.notes_of(list).unwrap();
            assert_dense(notes.iter().map(|n| n.position));
            notes.into_iter().map(|n| n.id).collect()
        }
    }

    fn assert_dense(positions: impl Iterator<Item = u64>) {
        let positions: Vec<u64> = positions.collect();
        let expected: Vec<u64> = (1..=positions.len() as u64).collect();
        assert_eq!(positions, expected, "positions must be dense and distinct");
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(Event::decode(&frame).unwrap());
        }
        events
    }

    #[test]
    fn test_empty_frame_is_ignored() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        h.dispatcher.dispatch(me, "   ").unwrap();
        h.dispatcher.dispatch_bytes(me, b"").unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_unknown_command_answers_origin_only() {
        let h = Harness::new();
        let (me, mut rx_me) = h.connect();
        let (_other, mut rx_other) = h.connect();

        h.send(me, json!({"command": "LAUNCH", "data": {}})).unwrap();
        assert_eq!(drain(&mut rx_me), vec![Event::error(COMMAND_NOT_SUPPORTED)]);
        assert!(drain(&mut rx_other).is_empty());
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let err = h.dispatcher.dispatch(me, "{oops").unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::Malformed(_))));
        assert!(!err.is_fatal());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_add_board_echoes_and_refreshes_everyone() {
        let h = Harness::new();
        let (me, mut rx_me) = h.connect();
        let (_other, mut rx_other) = h.connect();

        h.send(me, json!({"command": "ADD_BOARD", "data": {"title": "Launch"}})).unwrap();

        for rx in [&mut rx_me, &mut rx_other] {
            let events = drain(rx);
            assert_eq!(events.len(), 2);
            let Event::AddBoard(added) = &events[0] else { panic!("expected ADD_BOARD, got {:?}", events[0]) };
            assert_eq!(added.id, EntityId(1));
            assert_eq!(added.title, "Launch");
            let Event::BoardList(boards) = &events[1] else { panic!("expected BOARD_LIST") };
            assert_eq!(boards.len(), 1);
        }
    }

    #[test]
    fn test_get_board_list_replies_to_requester() {
        let h = Harness::new();
        let (me, mut rx_me) = h.connect();
        let (_other, mut rx_other) = h.connect();
        h.board_with_lists(me, &[]);
        drain(&mut rx_me);
        drain(&mut rx_other);

        h.send(me, json!({"command": "GET_BOARD_LIST"})).unwrap();
        let events = drain(&mut rx_me);
        assert!(matches!(events.as_slice(), [Event::BoardList(boards)] if boards.len() == 1));
        assert!(drain(&mut rx_other).is_empty());
    }

    #[test]
    fn test_get_board_returns_ordered_tree() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["todo", "doing", "done"]);
        let notes = h.notes(me, lists[0], 2);
        h.send(
            me,
            json!({"command": "MOVE_LIST", "data": {"board_id": board.to_string(), "list_ids": [lists[2].to_string()]}}),
        )
        .unwrap();
        drain(&mut rx);

        h.send(me, json!({"command": "GET_BOARD", "data": {"id": board.to_string()}})).unwrap();
        let events = drain(&mut rx);
        let [Event::Board(Board { lists: got, .. })] = events.as_slice() else {
            panic!("expected BOARD, got {events:?}")
        };
        let titles: Vec<&str> = got.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["done", "todo", "doing"]);
        let note_ids: Vec<EntityId> = got[1].notes.iter().map(|n| n.id).collect();
        assert_eq!(note_ids, notes);
    }

    #[test]
    fn test_get_missing_board_sends_nothing() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let err = h.send(me, json!({"command": "GET_BOARD", "data": {"id": "42"}})).unwrap_err();
        assert_eq!(err, SyncError::NotFound { kind: EntityKind::Board, id: EntityId(42) });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_move_list_skips_sender_and_filters_stale_ids() {
        let h = Harness::new();
        let (me, mut rx_me) = h.connect();
        let (_other, mut rx_other) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["a", "b", "c"]);
        drain(&mut rx_me);
        drain(&mut rx_other);

        h.send(
            me,
            json!({"command": "MOVE_LIST", "data": {
                "board_id": board.to_string(),
                "list_ids": [lists[2].to_string(), "999", lists[0].to_string()]
            }}),
        )
        .unwrap();

        assert_eq!(h.list_order(board), vec![lists[2], lists[0], lists[1]]);
        assert!(drain(&mut rx_me).is_empty());
        let events = drain(&mut rx_other);
        assert!(matches!(events.as_slice(), [Event::MoveList(_)]));
    }

    #[test]
    fn test_move_list_by_direction() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["a", "b", "c"]);

        let mv = |list: EntityId, direction: &str| {
            h.send(
                me,
                json!({"command": "MOVE_LIST", "data": {
                    "board_id": board.to_string(), "id": list.to_string(), "direction": direction
                }}),
            )
            .unwrap();
        };

        mv(lists[2], "LEFT");
        assert_eq!(h.list_order(board), vec![lists[0], lists[2], lists[1]]);
        mv(lists[0], "LEFT");
        assert_eq!(h.list_order(board), vec![lists[0], lists[2], lists[1]]);
        mv(lists[1], "RIGHT");
        assert_eq!(h.list_order(board), vec![lists[0], lists[2], lists[1]]);
        mv(lists[0], "RIGHT");
        assert_eq!(h.list_order(board), vec![lists[2], lists[0], lists[1]]);
    }

    #[test]
    fn test_move_list_without_order_is_rejected() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (board, _) = h.board_with_lists(me, &["a"]);
        let err = h
            .send(me, json!({"command": "MOVE_LIST", "data": {"board_id": board.to_string()}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::InvalidPayload { .. })));
    }

    #[test]
    fn test_edit_note_anchor_moves() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (_, lists) = h.board_with_lists(me, &["l"]);
        let n = h.notes(me, lists[0], 4);
        let (a, b, c, d) = (n[0], n[1], n[2], n[3]);

        h.send(
            me,
            json!({"command": "EDIT_NOTE", "data": {"id": d.to_string(), "previous_note_id": a.to_string()}}),
        )
        .unwrap();
        assert_eq!(h.note_order(lists[0]), vec![a, d, b, c]);

        h.send(me, json!({"command": "EDIT_NOTE", "data": {"id": d.to_string(), "previous_note_id": "0"}}))
            .unwrap();
        assert_eq!(h.note_order(lists[0]), vec![d, a, b, c]);

        // unknown anchor leaves the order alone
        h.send(me, json!({"command": "EDIT_NOTE", "data": {"id": b.to_string(), "previous_note_id": "777"}}))
            .unwrap();
        assert_eq!(h.note_order(lists[0]), vec![d, a, b, c]);
    }

    #[test]
    fn test_edit_note_without_fields_only_echoes() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (_, lists) = h.board_with_lists(me, &["l"]);
        let n = h.notes(me, lists[0], 1);
        let before = h.store.note(n[0]).unwrap();
        drain(&mut rx);

        h.send(me, json!({"command": "EDIT_NOTE", "data": {"id": n[0].to_string()}})).unwrap();
        assert_eq!(h.store.note(n[0]).unwrap(), before);
        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [Event::EditNote(edit)] if edit.id == n[0]));
    }

    #[test]
    fn test_edit_note_fields_and_list_change() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (_, lists) = h.board_with_lists(me, &["from", "to"]);
        let from = h.notes(me, lists[0], 3);
        let to = h.notes(me, lists[1], 2);

        h.send(
            me,
            json!({"command": "EDIT_NOTE", "data": {
                "id": from[1].to_string(), "list_id": lists[1].to_string(),
                "text": "moved", "min": true
            }}),
        )
        .unwrap();

        assert_eq!(h.note_order(lists[0]), vec![from[0], from[2]]);
        assert_eq!(h.note_order(lists[1]), vec![to[0], to[1], from[1]]);
        let note = h.store.note(from[1]).unwrap().unwrap();
        assert_eq!(note.text, "moved");
        assert!(note.minimized);
        assert!(!note.raw);

        h.send(
            me,
            json!({"command": "EDIT_NOTE", "data": {
                "id": from[0].to_string(), "list_id": lists[1].to_string(), "previous_note_id": "0"
            }}),
        )
        .unwrap();
        assert_eq!(h.note_order(lists[0]), vec![from[2]]);
        assert_eq!(h.note_order(lists[1]), vec![from[0], to[0], to[1], from[1]]);
    }

    #[test]
    fn test_edit_missing_note_is_not_found() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let err = h
            .send(me, json!({"command": "EDIT_NOTE", "data": {"id": "5", "text": "x"}}))
            .unwrap_err();
        assert_eq!(err, SyncError::NotFound { kind: EntityKind::Note, id: EntityId(5) });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_delete_list_cascades_and_redensifies() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["a", "b", "c"]);
        let notes = h.notes(me, lists[1], 2);
        drain(&mut rx);

        h.send(me, json!({"command": "DELETE_LIST", "data": {"id": lists[1].to_string()}}))
            .unwrap();
        assert_eq!(h.list_order(board), vec![lists[0], lists[2]]);
        for note in notes {
            assert!(h.store.note(note).unwrap().is_none());
        }
        assert!(matches!(drain(&mut rx).as_slice(), [Event::DeleteList(_)]));
    }

    #[test]
    fn test_delete_board_cascades_and_refreshes() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["a"]);
        let notes = h.notes(me, lists[0], 1);
        drain(&mut rx);

        h.send(me, json!({"command": "DELETE_BOARD", "data": {"id": board.to_string()}})).unwrap();
        assert!(h.store.board(board).unwrap().is_none());
        assert!(h.store.list(lists[0]).unwrap().is_none());
        assert!(h.store.note(notes[0]).unwrap().is_none());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [Event::DeleteBoard(_), Event::BoardList(boards)] if boards.is_empty()
        ));
    }

    #[test]
    fn test_delete_note_redensifies_and_reports_missing() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (_, lists) = h.board_with_lists(me, &["l"]);
        let notes = h.notes(me, lists[0], 3);
        drain(&mut rx);

        h.send(me, json!({"command": "DELETE_NOTE", "data": {"id": notes[0].to_string()}})).unwrap();
        assert_eq!(h.note_order(lists[0]), vec![notes[1], notes[2]]);

        let err = h
            .send(me, json!({"command": "DELETE_NOTE", "data": {"id": notes[0].to_string()}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_add_note_keeps_client_uuid() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let (_, lists) = h.board_with_lists(me, &["l"]);
        drain(&mut rx);

        h.send(
            me,
            json!({"command": "ADD_NOTE", "data": {"list_id": lists[0].to_string(), "text": "hi", "uuid": "tmp-7"}}),
        )
        .unwrap();
        let events = drain(&mut rx);
        let [Event::AddNote(note)] = events.as_slice() else { panic!("expected ADD_NOTE") };
        assert_eq!(note.uuid.as_deref(), Some("tmp-7"));
        assert!(note.id.is_some());
    }

    #[test]
    fn test_add_list_to_missing_board_broadcasts_nothing() {
        let h = Harness::new();
        let (me, mut rx) = h.connect();
        let err = h
            .send(me, json!({"command": "ADD_LIST", "data": {"board_id": "3", "title": "x"}}))
            .unwrap_err();
        assert_eq!(err, SyncError::NotFound { kind: EntityKind::Board, id: EntityId(3) });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_lagging_connection_is_dropped() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (slow, mut slow_rx) = h.connect_with(1);

        h.send(me, json!({"command": "ADD_BOARD", "data": {"title": "one"}})).unwrap();
        h.send(me, json!({"command": "ADD_BOARD", "data": {"title": "two"}})).unwrap();

        assert!(h.registry.get(slow).is_none());
        assert!(h.registry.get(me).is_some());
        assert!(matches!(
            Event::decode(&slow_rx.try_recv().unwrap()).unwrap(),
            Event::AddBoard(_)
        ));
        assert_eq!(slow_rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
        assert_eq!(h.store.boards().unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_reorders_serialize() {
        let h = Harness::new();
        let (me, _rx) = h.connect();
        let (board, lists) = h.board_with_lists(me, &["a", "b", "c", "d", "e"]);
        let (_observer, mut observer_rx) = h.connect_with(128);
        let forward: Vec<String> = lists.iter().map(|l| l.to_string()).collect();
        let backward: Vec<String> = forward.iter().rev().cloned().collect();

        std::thread::scope(|scope| {
            for order in [&forward, &backward] {
                let h = &h;
                scope.spawn(move || {
                    let (conn, _rx) = h.connect();
                    for _ in 0..20 {
                        h.send(
                            conn,
                            json!({"command": "MOVE_LIST", "data": {"board_id": board.to_string(), "list_ids": order}}),
                        )
                        .unwrap();
                    }
                });
            }
        });

        let final_order = h.list_order(board);
        let reversed: Vec<EntityId> = lists.iter().rev().copied().collect();
        assert!(final_order == lists || final_order == reversed);

        // Echoes arrive in commit order, so the last one matches the store.
        let echoes: Vec<Vec<EntityId>> = drain(&mut observer_rx)
            .into_iter()
            .filter_map(|event| match event {
                Event::MoveList(moved) => Some(moved.list_ids),
                _ => None,
            })
            .collect();
        assert_eq!(echoes.len(), 40);
        assert_eq!(echoes.last(), Some(&final_order));
    }

    /// Store whose every operation fails like a broken disk.
    struct FaultyStore;

    impl StoreRead for FaultyStore {
        fn boards(&self) -> Result<Vec<Board>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
        fn board(&self, _: EntityId) -> Result<Option<Board>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
        fn list(&self, _: EntityId) -> Result<Option<List>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
        fn note(&self, _: EntityId) -> Result<Option<Note>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
        fn lists_of(&self, _: EntityId) -> Result<Vec<List>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
        fn notes_of(&self, _: EntityId) -> Result<Vec<Note>, StoreError> {
            Err(StoreError::Database("io".into()))
        }
    }

    impl Store for FaultyStore {
        fn run_atomic(
            &self,
            _unit: &mut dyn FnMut(&mut dyn Txn) -> Result<(), StoreError>,
            _on_commit: &mut dyn FnMut(),
        ) -> Result<(), StoreError> {
            Err(StoreError::Database("io".into()))
        }
    }

    #[test]
    fn test_store_fault_is_fatal_and_silent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Arc::new(FaultyStore), Fanout::new(registry.clone()));
        let (outbox, mut rx) = Outbox::channel(8);
        let me = registry.register(outbox);

        let err = dispatcher
            .dispatch(me, r#"{"command":"ADD_BOARD","data":{"title":"x"}}"#)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(drain(&mut rx).is_empty());
    }
}
