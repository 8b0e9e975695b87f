//! JSON command protocol.
//!
//! Wire format, one envelope per text frame:
//! ```text
//! { "command": "<NAME>", "data": <payload> }
//! ```
//!
//! Inbound envelopes are decoded once into the closed [`Command`] type.
//! Outbound traffic is the closed [`Event`] type, which shares the same
//! envelope shape. Entity ids inside payloads are JSON strings.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::model::{Board, EntityId};
use crate::ordering::{Anchor, Direction};
use crate::storage::NotePatch;

/// Body of the error event sent for unknown commands.
pub const COMMAND_NOT_SUPPORTED: &str = "Command not supported";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a `{command, data}` envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    /// The envelope named a known command but `data` did not fit it.
    #[error("Invalid payload for {command}: {reason}")]
    InvalidPayload { command: &'static str, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ─── Payloads ─────────────────────────────────────────────────────────

/// Payload carrying a single target id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddBoard {
    /// Assigned by the store; empty on the request.
    #[serde(default, skip_serializing_if = "EntityId::is_none")]
    pub id: EntityId,
    #[serde(default)]
    pub title: String,
}

/// Rename payload shared by boards and lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditTitle {
    pub id: EntityId,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddList {
    #[serde(default, skip_serializing_if = "EntityId::is_none")]
    pub id: EntityId,
    pub board_id: EntityId,
    #[serde(default)]
    pub title: String,
}

/// Reposition lists on a board.
///
/// `list_ids` is the requested full order. When it is empty, `id` and
/// `direction` describe a single neighbour swap instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveList {
    #[serde(default, skip_serializing_if = "EntityId::is_none")]
    pub id: EntityId,
    pub board_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNote {
    #[serde(default, skip_serializing_if = "EntityId::is_none")]
    pub id: EntityId,
    /// Client correlation token, echoed back untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub text: String,
    pub list_id: EntityId,
}

/// Partial note update. Absent or zero-valued fields leave the note unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditNote {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "EntityId::is_none")]
    pub list_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(default, alias = "min", skip_serializing_if = "Option::is_none")]
    pub minimized: Option<bool>,
    /// `"0"` moves the note to the head of its list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_note_id: Option<EntityId>,
}

impl EditNote {
    /// Field changes requested by this edit.
    pub fn patch(&self) -> NotePatch {
        NotePatch {
            text: self.text.clone().filter(|t| !t.is_empty()),
            list_id: self.list_id.non_zero(),
            raw: self.raw,
            minimized: self.minimized,
        }
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.previous_note_id.map(Anchor::from_id)
    }
}

// ─── Commands ─────────────────────────────────────────────────────────

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetBoardList,
    GetBoard(Target),
    AddBoard(AddBoard),
    DeleteBoard(Target),
    EditBoard(EditTitle),
    AddList(AddList),
    DeleteList(Target),
    EditList(EditTitle),
    MoveList(MoveList),
    AddNote(AddNote),
    DeleteNote(Target),
    EditNote(EditNote),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetBoardList => "GET_BOARD_LIST",
            Command::GetBoard(_) => "GET_BOARD",
            Command::AddBoard(_) => "ADD_BOARD",
            Command::DeleteBoard(_) => "DELETE_BOARD",
            Command::EditBoard(_) => "EDIT_BOARD",
            Command::AddList(_) => "ADD_LIST",
            Command::DeleteList(_) => "DELETE_LIST",
            Command::EditList(_) => "EDIT_LIST",
            Command::MoveList(_) => "MOVE_LIST",
            Command::AddNote(_) => "ADD_NOTE",
            Command::DeleteNote(_) => "DELETE_NOTE",
            Command::EditNote(_) => "EDIT_NOTE",
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Zero bytes or whitespace only; ignored.
    Empty,
    Command(Command),
    /// Well-formed envelope with a command name nobody handles.
    Unsupported(String),
}

#[derive(Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Inbound {
    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        if frame.trim().is_empty() {
            return Ok(Inbound::Empty);
        }

        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let data = envelope.data;

        let command = match envelope.command.as_str() {
            "GET_BOARD_LIST" => Command::GetBoardList,
            "GET_BOARD" => Command::GetBoard(payload("GET_BOARD", data)?),
            "ADD_BOARD" => Command::AddBoard(payload("ADD_BOARD", data)?),
            "DELETE_BOARD" => Command::DeleteBoard(payload("DELETE_BOARD", data)?),
            "EDIT_BOARD" => Command::EditBoard(payload("EDIT_BOARD", data)?),
            "ADD_LIST" => Command::AddList(payload("ADD_LIST", data)?),
            "DELETE_LIST" => Command::DeleteList(payload("DELETE_LIST", data)?),
            "EDIT_LIST" => Command::EditList(payload("EDIT_LIST", data)?),
            "MOVE_LIST" => Command::MoveList(payload("MOVE_LIST", data)?),
            "ADD_NOTE" => Command::AddNote(payload("ADD_NOTE", data)?),
            "DELETE_NOTE" => Command::DeleteNote(payload("DELETE_NOTE", data)?),
            "EDIT_NOTE" => Command::EditNote(payload("EDIT_NOTE", data)?),
            _ => return Ok(Inbound::Unsupported(envelope.command)),
        };
        Ok(Inbound::Command(command))
    }

    /// Decode a binary frame as UTF-8 text.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame)
            .map_err(|e| ProtocolError::Malformed(format!("frame is not UTF-8: {e}")))?;
        Self::decode(text)
    }
}

fn payload<T: DeserializeOwned>(
    command: &'static str,
    data: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        command,
        reason: e.to_string(),
    })
}

// ─── Events ───────────────────────────────────────────────────────────

/// An outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum Event {
    #[serde(rename = "BOARD_LIST")]
    BoardList(Vec<Board>),
    #[serde(rename = "BOARD")]
    Board(Board),
    #[serde(rename = "ADD_BOARD")]
    AddBoard(AddBoard),
    #[serde(rename = "DELETE_BOARD")]
    DeleteBoard(Target),
    #[serde(rename = "EDIT_BOARD")]
    EditBoard(EditTitle),
    #[serde(rename = "ADD_LIST")]
    AddList(AddList),
    #[serde(rename = "DELETE_LIST")]
    DeleteList(Target),
    #[serde(rename = "EDIT_LIST")]
    EditList(EditTitle),
    #[serde(rename = "MOVE_LIST")]
    MoveList(MoveList),
    #[serde(rename = "ADD_NOTE")]
    AddNote(AddNote),
    #[serde(rename = "DELETE_NOTE")]
    DeleteNote(Target),
    #[serde(rename = "EDIT_NOTE")]
    EditNote(EditNote),
    Error(String),
}

impl Event {
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error(message.into())
    }

    pub fn not_supported() -> Self {
        Event::Error(COMMAND_NOT_SUPPORTED.to_string())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::BoardList(_) => "BOARD_LIST",
            Event::Board(_) => "BOARD",
            Event::AddBoard(_) => "ADD_BOARD",
            Event::DeleteBoard(_) => "DELETE_BOARD",
            Event::EditBoard(_) => "EDIT_BOARD",
            Event::AddList(_) => "ADD_LIST",
            Event::DeleteList(_) => "DELETE_LIST",
            Event::EditList(_) => "EDIT_LIST",
            Event::MoveList(_) => "MOVE_LIST",
            Event::AddNote(_) => "ADD_NOTE",
            Event::DeleteNote(_) => "DELETE_NOTE",
            Event::EditNote(_) => "EDIT_NOTE",
            Event::Error(_) => "Error",
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
