//! One handler per command kind.
//!
//! A handler runs its store work as one atomic unit and, only after the unit
//! commits, emits its events. A failed unit emits nothing. Events are emitted
//! before the next unit starts, so every connection sees them in commit order.

use crate::broadcast::{ConnectionId, Fanout};
use crate::error::SyncError;
use crate::model::EntityId;
use crate::ordering::{self, Direction};
use crate::protocol::{AddBoard, AddList, AddNote, EditNote, EditTitle, Event, MoveList, ProtocolError, Target};
use crate::storage::{
    expect_one, write_list_order, write_note_order, EntityKind, Store, StoreError, StoreExt, Txn,
};

/// What a handler runs against.
pub(crate) struct Context<'a> {
    pub store: &'a dyn Store,
    pub fanout: &'a Fanout,
    pub origin: ConnectionId,
}

impl Context<'_> {
    /// Run `unit` atomically and `publish` its result in commit order.
    fn commit<T>(
        &self,
        unit: impl FnOnce(&mut dyn Txn) -> Result<T, StoreError>,
        publish: impl FnOnce(T) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        self.store.commit_then(unit, publish)?
    }

    fn reply(&self, event: Event) -> Result<(), SyncError> {
        self.fanout.send_to(self.origin, &event)?;
        Ok(())
    }

    fn broadcast(&self, event: Event) -> Result<(), SyncError> {
        self.fanout.broadcast(&event, None)?;
        Ok(())
    }
}

fn list_ids(txn: &dyn Txn, board_id: EntityId) -> Result<Vec<EntityId>, StoreError> {
    Ok(txn.lists_of(board_id)?.into_iter().map(|list| list.id).collect())
}

fn note_ids(txn: &dyn Txn, list_id: EntityId) -> Result<Vec<EntityId>, StoreError> {
    Ok(txn.notes_of(list_id)?.into_iter().map(|note| note.id).collect())
}

// ─── Boards ───────────────────────────────────────────────────────────

pub(crate) fn get_board_list(ctx: &Context<'_>) -> Result<(), SyncError> {
    ctx.commit(|txn| txn.boards(), |boards| ctx.reply(Event::BoardList(boards)))
}

pub(crate) fn get_board(ctx: &Context<'_>, target: Target) -> Result<(), SyncError> {
    ctx.commit(
        |txn| {
            let mut board = txn
                .board(target.id)?
                .ok_or_else(|| StoreError::not_found(EntityKind::Board, target.id))?;
            let mut lists = txn.lists_of(target.id)?;
            for list in &mut lists {
                list.notes = txn.notes_of(list.id)?;
            }
            board.lists = lists;
            Ok(board)
        },
        |board| ctx.reply(Event::Board(board)),
    )
}

pub(crate) fn add_board(ctx: &Context<'_>, request: AddBoard) -> Result<(), SyncError> {
    ctx.commit(
        |txn| {
            let id = txn.create_board(&request.title)?;
            Ok((id, txn.boards()?))
        },
        |(id, boards)| {
            log::info!("Board {id} created by {}", ctx.origin);
            ctx.broadcast(Event::AddBoard(AddBoard { id, ..request.clone() }))?;
            ctx.broadcast(Event::BoardList(boards))
        },
    )
}

pub(crate) fn delete_board(ctx: &Context<'_>, target: Target) -> Result<(), SyncError> {
    let id = target.id;
    ctx.commit(
        |txn| {
            expect_one(txn.delete_board(id)?, EntityKind::Board, id)?;
            txn.boards()
        },
        |boards| {
            log::info!("Board {id} deleted by {}", ctx.origin);
            ctx.broadcast(Event::DeleteBoard(target))?;
            ctx.broadcast(Event::BoardList(boards))
        },
    )
}

pub(crate) fn edit_board(ctx: &Context<'_>, request: EditTitle) -> Result<(), SyncError> {
    ctx.commit(
        |txn| expect_one(txn.rename_board(request.id, &request.title)?, EntityKind::Board, request.id),
        |()| ctx.broadcast(Event::EditBoard(request.clone())),
    )
}

// ─── Lists ────────────────────────────────────────────────────────────

pub(crate) fn add_list(ctx: &Context<'_>, request: AddList) -> Result<(), SyncError> {
    ctx.commit(
        |txn| {
            let position = ordering::tail_position(
                txn.lists_of(request.board_id)?.iter().map(|list| list.position),
            );
            txn.create_list(request.board_id, &request.title, position)
        },
        |id| ctx.broadcast(Event::AddList(AddList { id, ..request.clone() })),
    )
}

pub(crate) fn delete_list(ctx: &Context<'_>, target: Target) -> Result<(), SyncError> {
    let id = target.id;
    ctx.commit(
        |txn| {
            let list = txn
                .list(id)?
                .ok_or_else(|| StoreError::not_found(EntityKind::List, id))?;
            expect_one(txn.delete_list(id)?, EntityKind::List, id)?;
            let remaining = list_ids(txn, list.board_id)?;
            write_list_order(txn, &remaining)
        },
        |()| ctx.broadcast(Event::DeleteList(target)),
    )
}

pub(crate) fn edit_list(ctx: &Context<'_>, request: EditTitle) -> Result<(), SyncError> {
    ctx.commit(
        |txn| expect_one(txn.rename_list(request.id, &request.title)?, EntityKind::List, request.id),
        |()| ctx.broadcast(Event::EditList(request.clone())),
    )
}

/// How a MOVE_LIST request encodes the new order.
enum ListMove<'r> {
    Sequence(&'r [EntityId]),
    Swap(EntityId, Direction),
}

pub(crate) fn move_list(ctx: &Context<'_>, request: MoveList) -> Result<(), SyncError> {
    let instruction = if !request.list_ids.is_empty() {
        ListMove::Sequence(&request.list_ids)
    } else {
        match (request.id.non_zero(), request.direction) {
            (Some(id), Some(direction)) => ListMove::Swap(id, direction),
            _ => {
                return Err(ProtocolError::InvalidPayload {
                    command: "MOVE_LIST",
                    reason: "expected list_ids or id with direction".into(),
                }
                .into())
            }
        }
    };

    ctx.commit(
        |txn| {
            if txn.board(request.board_id)?.is_none() {
                return Err(StoreError::not_found(EntityKind::Board, request.board_id));
            }
            let current = list_ids(txn, request.board_id)?;
            let order = match instruction {
                ListMove::Sequence(candidate) => ordering::reorder(&current, candidate),
                ListMove::Swap(id, direction) => match ordering::swap(&current, id, direction) {
                    Some(order) => order,
                    None => {
                        log::debug!("List {id} cannot move {direction:?}; order unchanged");
                        current
                    }
                },
            };
            write_list_order(txn, &order)
        },
        |()| {
            // The mover already shows the new order.
            ctx.fanout.broadcast(&Event::MoveList(request.clone()), Some(ctx.origin))?;
            Ok(())
        },
    )
}

// ─── Notes ────────────────────────────────────────────────────────────

pub(crate) fn add_note(ctx: &Context<'_>, request: AddNote) -> Result<(), SyncError> {
    ctx.commit(
        |txn| {
            if txn.list(request.list_id)?.is_none() {
                return Err(StoreError::not_found(EntityKind::List, request.list_id));
            }
            let position = ordering::tail_position(
                txn.notes_of(request.list_id)?.iter().map(|note| note.position),
            );
            txn.create_note(request.list_id, &request.text, position)
        },
        |id| ctx.broadcast(Event::AddNote(AddNote { id, ..request.clone() })),
    )
}

pub(crate) fn delete_note(ctx: &Context<'_>, target: Target) -> Result<(), SyncError> {
    let id = target.id;
    ctx.commit(
        |txn| {
            let note = txn
                .note(id)?
                .ok_or_else(|| StoreError::not_found(EntityKind::Note, id))?;
            expect_one(txn.delete_note(id)?, EntityKind::Note, id)?;
            let remaining = note_ids(txn, note.list_id)?;
            write_note_order(txn, &remaining)
        },
        |()| ctx.broadcast(Event::DeleteNote(target)),
    )
}

pub(crate) fn edit_note(ctx: &Context<'_>, request: EditNote) -> Result<(), SyncError> {
    let patch = request.patch();
    let anchor = request.anchor();

    if patch.is_empty() && anchor.is_none() {
        return ctx.commit(|_| Ok(()), |()| ctx.broadcast(Event::EditNote(request)));
    }

    ctx.commit(
        |txn| {
            let note = txn
                .note(request.id)?
                .ok_or_else(|| StoreError::not_found(EntityKind::Note, request.id))?;
            if !patch.is_empty() {
                expect_one(txn.update_note_fields(request.id, &patch)?, EntityKind::Note, request.id)?;
            }

            let list_id = patch.list_id.unwrap_or(note.list_id);
            let changed_list = list_id != note.list_id;
            if changed_list {
                let remaining = note_ids(txn, note.list_id)?;
                write_note_order(txn, &remaining)?;
            }

            let siblings = note_ids(txn, list_id)?;
            let order = match anchor.and_then(|anchor| ordering::move_after(&siblings, request.id, anchor)) {
                Some(order) => Some(order),
                None if changed_list => {
                    let mut order = ordering::without(&siblings, request.id);
                    order.push(request.id);
                    Some(order)
                }
                None => {
                    if let Some(anchor) = anchor {
                        log::debug!("Note {} stays in place, anchor {anchor:?} not in list {list_id}", request.id);
                    }
                    None
                }
            };
            match order {
                Some(order) => write_note_order(txn, &order),
                None => Ok(()),
            }
        },
        |()| ctx.broadcast(Event::EditNote(request.clone())),
    )
}
