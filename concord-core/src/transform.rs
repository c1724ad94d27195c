//! Operational transform.
//!
//! Rebases an operation created against an older version so that it can be
//! applied after the operations that were committed concurrently. All
//! functions are pure.
//!
//! For any two operations `a` and `b` created against the same state:
//!
//! ```text
//! apply(apply(S, a), transform_pair(b, a)) == apply(apply(S, b), transform_pair(a, b))
//! ```
//!
//! Overlapping edits are resolved by priority: the operation with the
//! higher `(id, author)` replaces the union of both ranges with its own
//! payload.

use crate::error::ConflictError;
use crate::operation::{OpKind, Operation};

/// Rebase `op` over `concurrent`, the operations committed since
/// `op.base_version`, in commit order.
///
/// `concurrent[i]` must be based on `op.base_version + i`.
pub fn transform(op: &Operation, concurrent: &[Operation]) -> Result<Operation, ConflictError> {
    let mut rebased = op.clone();
    for (index, applied) in concurrent.iter().enumerate() {
        let expected = op
            .base_version
            .checked_add(index as u64)
            .ok_or(ConflictError::Overflow { id: op.id })?;
        if applied.base_version != expected {
            return Err(ConflictError::Discontinuous {
                index,
                expected,
                found: applied.base_version,
            });
        }
        rebased = transform_pair(&rebased, applied)?;
    }
    rebased.base_version = op
        .base_version
        .checked_add(concurrent.len() as u64)
        .ok_or(ConflictError::Overflow { id: op.id })?;
    Ok(rebased)
}

/// Rebase `op` over a single operation `applied` created against the same
/// state. The base version is left untouched.
pub fn transform_pair(op: &Operation, applied: &Operation) -> Result<Operation, ConflictError> {
    if applied.is_noop() {
        return Ok(op.clone());
    }
    if op.is_noop() {
        return map_point(op, applied);
    }
    match (op.is_splice(), applied.is_splice()) {
        (true, true) => splice_over_splice(op, applied),
        (false, true) => format_over_splice(op, applied),
        (true, false) => Ok(splice_over_format(op, applied)),
        (false, false) => Ok(op.clone()),
    }
}

/// Resolve two overlapping splices, `remote` having been applied.
///
/// The higher-priority operation wins: the union of both removed ranges is
/// replaced by the winner's payload and attributes. Inputs that do not
/// overlap are transformed normally.
pub fn resolve_conflict(local: &Operation, remote: &Operation) -> Result<Operation, ConflictError> {
    if !overlaps(local, remote) {
        return transform_pair(local, remote);
    }
    let overflow = ConflictError::Overflow { id: local.id };
    let (ls, le) = range(local).ok_or(overflow.clone())?;
    let (rs, re) = range(remote).ok_or(overflow.clone())?;
    let union_start = ls.min(rs);
    let union_end = le.max(re);
    let remote_ins = remote.inserted_len();

    if local.priority() > remote.priority() {
        // Remote text now sits inside the union; remove all of it.
        let removed = (union_end - union_start - remote.removed_len())
            .checked_add(remote_ins)
            .ok_or(overflow)?;
        Ok(rewrite(local, local, union_start, removed))
    } else {
        // Keep the remote result; drop whatever the union adds around it.
        if union_start == rs && union_end == re {
            let mut noop = rewrite(local, remote, union_start, 0);
            noop.kind = OpKind::Delete;
            noop.payload.clear();
            noop.attributes.clear();
            return Ok(noop);
        }
        let removed = (rs - union_start)
            .checked_add(remote_ins)
            .and_then(|n| n.checked_add(union_end - re))
            .ok_or(overflow)?;
        Ok(rewrite(local, remote, union_start, removed))
    }
}

/// Whether two splices touch a common region that neither ordering rule
/// can separate.
pub fn overlaps(a: &Operation, b: &Operation) -> bool {
    if !a.is_splice() || !b.is_splice() || a.is_noop() || b.is_noop() {
        return false;
    }
    match (range(a), range(b)) {
        (Some((a_start, a_end)), Some((b_start, b_end))) => !(a_end <= b_start || b_end <= a_start),
        _ => false,
    }
}

fn range(op: &Operation) -> Option<(usize, usize)> {
    op.end().map(|end| (op.position, end))
}

/// Copy of `op` replacing `removed` chars at `position` with the winner's
/// text.
fn rewrite(op: &Operation, winner: &Operation, position: usize, removed: usize) -> Operation {
    let payload = match winner.kind {
        OpKind::Insert => winner.payload.clone(),
        _ => String::new(),
    };
    Operation {
        kind: if payload.is_empty() { OpKind::Delete } else { OpKind::Insert },
        position,
        length: removed,
        attributes: if payload.is_empty() {
            Default::default()
        } else {
            winner.attributes.clone()
        },
        payload,
        ..op.clone()
    }
}

fn shift(op: &Operation, applied: &Operation) -> Result<Operation, ConflictError> {
    let position = (op.position - applied.removed_len())
        .checked_add(applied.inserted_len())
        .ok_or(ConflictError::Overflow { id: op.id })?;
    Ok(Operation { position, ..op.clone() })
}

/// Carry a zero-length operation across `applied` so it stays in bounds.
/// A point inside a removed range lands at its start.
fn map_point(op: &Operation, applied: &Operation) -> Result<Operation, ConflictError> {
    if !applied.is_splice() {
        return Ok(op.clone());
    }
    let overflow = ConflictError::Overflow { id: op.id };
    let (as_, ae) = range(applied).ok_or(overflow.clone())?;
    let position = if op.position < as_ {
        op.position
    } else if op.position >= ae {
        (op.position - applied.removed_len())
            .checked_add(applied.inserted_len())
            .ok_or(overflow)?
    } else {
        as_
    };
    Ok(Operation { position, ..op.clone() })
}

fn splice_over_splice(op: &Operation, applied: &Operation) -> Result<Operation, ConflictError> {
    let overflow = ConflictError::Overflow { id: op.id };
    let (os, oe) = range(op).ok_or(overflow.clone())?;
    let (as_, ae) = range(applied).ok_or(overflow)?;

    // Two inserts at the same spot: lower priority lands first.
    if os == oe && as_ == ae && os == as_ {
        return if op.priority() < applied.priority() {
            Ok(op.clone())
        } else {
            shift(op, applied)
        };
    }
    if oe <= as_ {
        return Ok(op.clone());
    }
    if ae <= os {
        return shift(op, applied);
    }
    resolve_conflict(op, applied)
}

fn format_over_splice(op: &Operation, applied: &Operation) -> Result<Operation, ConflictError> {
    let overflow = ConflictError::Overflow { id: op.id };
    let (start, end) = range(op).ok_or(overflow.clone())?;
    let (as_, ae) = range(applied).ok_or(overflow.clone())?;
    let removed = applied.removed_len();
    let inserted = applied.inserted_len();
    let after = as_.checked_add(inserted).ok_or(overflow.clone())?;

    let new_start = if start < as_ {
        start
    } else if start >= ae {
        (start - removed).checked_add(inserted).ok_or(overflow.clone())?
    } else {
        after
    };
    let new_end = if end <= as_ {
        end
    } else if end > ae {
        (end - removed).checked_add(inserted).ok_or(overflow)?
    } else {
        after
    };
    Ok(Operation {
        position: new_start,
        length: new_end.saturating_sub(new_start),
        ..op.clone()
    })
}

fn splice_over_format(op: &Operation, applied: &Operation) -> Operation {
    let mut rebased = op.clone();
    let inside = match applied.end() {
        Some(end) => applied.position < op.position && op.position < end,
        None => false,
    };
    if inside && op.kind == OpKind::Insert && !op.payload.is_empty() {
        rebased.attributes.insert(applied.payload.clone());
    }
    rebased
}
