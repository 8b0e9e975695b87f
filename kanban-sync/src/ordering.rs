//! Sibling ordering engine.
//!
//! Every function here is pure: it takes the current order of sibling ids
//! (head first) and returns the new order. [`positions`] turns an order into
//! the `(id, position)` plan the caller writes through the store inside one
//! atomic unit, so positions under a parent are always dense and distinct.
//!
//! Two encodings are supported:
//! - whole-sequence replacement ([`reorder`]), used for bulk list moves
//! - anchor-based single-item moves ([`move_after`]), used for notes
//!
//! [`swap`] is the neighbour-swap fallback for list moves that carry a
//! direction instead of a full sequence.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::{EntityId, Position};

/// Where a moved item lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Before every other sibling.
    Head,
    /// Immediately after the given sibling.
    After(EntityId),
}

impl Anchor {
    /// The zero id is the head sentinel.
    pub fn from_id(id: EntityId) -> Self {
        if id.is_none() {
            Anchor::Head
        } else {
            Anchor::After(id)
        }
    }
}

/// Neighbour-swap direction for list moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LEFT")]
    Left,
    #[serde(rename = "RIGHT")]
    Right,
}

/// Assign dense 1-based positions in the given order.
pub fn positions(order: &[EntityId]) -> Vec<(EntityId, Position)> {
    order
        .iter()
        .enumerate()
        .map(|(idx, id)| (*id, idx as Position + 1))
        .collect()
}

/// Position for a child appended after `existing` positions.
pub fn tail_position<I>(existing: I) -> Position
where
    I: IntoIterator<Item = Position>,
{
    existing.into_iter().max().unwrap_or(0) + 1
}

/// Whole-sequence replacement.
///
/// `candidate` is filtered down to ids present in `current` (first occurrence
/// wins, stale ids are dropped). Siblings the candidate leaves out keep their
/// relative order and follow at the tail.
pub fn reorder(current: &[EntityId], candidate: &[EntityId]) -> Vec<EntityId> {
    let siblings: HashSet<EntityId> = current.iter().copied().collect();
    let mut seen = HashSet::with_capacity(current.len());
    let mut order = Vec::with_capacity(current.len());

    for id in candidate {
        if siblings.contains(id) && seen.insert(*id) {
            order.push(*id);
        }
    }
    for id in current {
        if seen.insert(*id) {
            order.push(*id);
        }
    }
    order
}

/// Anchor-based single-item move.
///
/// Returns `None` when the move is a no-op: the item is not a sibling, or the
/// anchor is missing or is the item itself.
pub fn move_after(current: &[EntityId], item: EntityId, anchor: Anchor) -> Option<Vec<EntityId>> {
    if !current.contains(&item) {
        return None;
    }

    let mut order: Vec<EntityId> = current.iter().copied().filter(|id| *id != item).collect();
    match anchor {
        Anchor::Head => order.insert(0, item),
        Anchor::After(target) => {
            if target == item {
                return None;
            }
            let idx = order.iter().position(|id| *id == target)?;
            order.insert(idx + 1, item);
        }
    }
    Some(order)
}

/// Swap `item` with its neighbour in `direction`.
///
/// The head cannot move left and the tail cannot move right; both return `None`.
pub fn swap(current: &[EntityId], item: EntityId, direction: Direction) -> Option<Vec<EntityId>> {
    let idx = current.iter().position(|id| *id == item)?;
    let other = match direction {
        Direction::Left => idx.checked_sub(1)?,
        Direction::Right => {
            let next = idx + 1;
            if next >= current.len() {
                return None;
            }
            next
        }
    };
    let mut order = current.to_vec();
    order.swap(idx, other);
    Some(order)
}

/// `current` without `removed`, ready to be re-densified.
pub fn without(current: &[EntityId], removed: EntityId) -> Vec<EntityId> {
    current.iter().copied().filter(|id| *id != removed).collect()
}
