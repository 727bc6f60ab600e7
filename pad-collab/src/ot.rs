//! Operation algebra: diff, apply, transform and selection mapping.
//!
//! Every function here is pure. Offsets count `char`s (Unicode scalar
//! values). Locations inside a batch are offsets into the batch's base
//! text and are non-decreasing, so a batch replays left-to-right with a
//! single cursor:
//!
//! ```text
//! base:   c a t
//!         0 1 2 3
//! batch:  [Delete@0 'c', Add@3 's']
//! result: a t s
//! ```

use serde::{Deserialize, Serialize};

use crate::protocol::{ClientId, ClientIdentity, SessionId};

/// Kind of an atomic edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `ch` before the unit at `location`.
    Add,
    /// Remove the unit at `location`.
    Delete,
    /// Cancelled edit produced by a double delete. Has no effect.
    Noop,
}

/// A single-character edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Op {
    pub kind: OpKind,
    pub location: usize,
    /// Inserted character for `Add`, removed character for `Delete`.
    pub ch: char,
    #[serde(rename = "clientId")]
    pub origin_client: ClientId,
    #[serde(rename = "session")]
    pub origin_session: SessionId,
    /// Client sequence number; only set on the first op of a committed batch.
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Ordered list of ops produced by one diff or one transform.
pub type Batch = Vec<Op>;

impl Op {
    pub fn add(location: usize, ch: char, origin: &ClientIdentity) -> Self {
        Self::new(OpKind::Add, location, ch, origin)
    }

    pub fn delete(location: usize, ch: char, origin: &ClientIdentity) -> Self {
        Self::new(OpKind::Delete, location, ch, origin)
    }

    fn new(kind: OpKind, location: usize, ch: char, origin: &ClientIdentity) -> Self {
        Self {
            kind,
            location,
            ch,
            origin_client: origin.client_id.clone(),
            origin_session: origin.session,
            seq: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind == OpKind::Noop
    }

    fn shifted(&self, shift: isize) -> Self {
        let location = self.location as isize + shift;
        Self {
            location: location.max(0) as usize,
            ..self.clone()
        }
    }
}

/// A `[start, end)` selection range. A caret has `start == end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn caret(pos: usize) -> Self {
        Self { start: pos, end: pos }
    }

    pub fn is_caret(&self) -> bool {
        self.start == self.end
    }

    /// Clamp both ends into `0..=len`.
    pub fn clamp(self, len: usize) -> Self {
        let end = self.end.min(len);
        Self {
            start: self.start.min(end),
            end,
        }
    }
}

/// Compute a minimal Add/Delete script that turns `s1` into `s2`.
///
/// The common prefix and suffix are stripped first so the O(n·m) table
/// only covers the region that actually differs. While backtracking,
/// matching characters are preferred, then an Add, then a Delete; the
/// fixed order keeps the output reproducible.
pub fn diff(s1: &str, s2: &str, origin: &ClientIdentity) -> Batch {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a = &a[prefix..a.len() - suffix];
    let b = &b[prefix..b.len() - suffix];
    let (n, m) = (a.len(), b.len());

    // dp[i * width + j]: edit distance between a[..i] and b[..j]
    let width = m + 1;
    let mut dp = vec![0usize; (n + 1) * width];
    for (j, cell) in dp.iter_mut().take(width).enumerate() {
        *cell = j;
    }
    for i in 1..=n {
        dp[i * width] = i;
        for j in 1..=m {
            let mut best = dp[(i - 1) * width + j].min(dp[i * width + j - 1]) + 1;
            if a[i - 1] == b[j - 1] && dp[(i - 1) * width + j - 1] < best {
                best = dp[(i - 1) * width + j - 1];
            }
            dp[i * width + j] = best;
        }
    }

    let mut ops = Vec::with_capacity(dp[n * width + m]);
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i == 0 {
            ops.push(Op::add(prefix, b[j - 1], origin));
            j -= 1;
        } else if j == 0 {
            ops.push(Op::delete(prefix + i - 1, a[i - 1], origin));
            i -= 1;
        } else if a[i - 1] == b[j - 1] && dp[i * width + j] == dp[(i - 1) * width + j - 1] {
            i -= 1;
            j -= 1;
        } else if dp[i * width + j] == dp[i * width + j - 1] + 1 {
            ops.push(Op::add(prefix + i, b[j - 1], origin));
            j -= 1;
        } else {
            ops.push(Op::delete(prefix + i - 1, a[i - 1], origin));
            i -= 1;
        }
    }

    ops.reverse();
    ops
}

/// Replay `batch` onto `base`.
///
/// Locations beyond the end of `base` clamp to the end, and a Delete with
/// nothing left to remove is dropped, so a malformed batch degrades
/// instead of panicking.
pub fn apply(base: &str, batch: &[Op]) -> String {
    let chars: Vec<char> = base.chars().collect();
    let mut out = String::with_capacity(base.len() + batch.len());
    let mut cursor = 0;

    for op in batch {
        if op.is_noop() {
            continue;
        }
        let loc = op.location.clamp(cursor, chars.len());
        out.extend(&chars[cursor..loc]);
        cursor = loc;

        match op.kind {
            OpKind::Add => out.push(op.ch),
            OpKind::Delete => {
                if cursor < chars.len() {
                    cursor += 1;
                }
            }
            OpKind::Noop => {}
        }
    }

    out.extend(&chars[cursor..]);
    out
}

/// Rewrite `ops` so it applies on top of a text that already has
/// `applied` folded in.
///
/// Same-location conflicts: two Deletes of one unit cancel (the second
/// becomes a `Noop`); otherwise the Add is ordered first. Two Adds at the
/// same location keep `applied`'s character first.
pub fn transform(applied: &[Op], ops: &[Op]) -> Batch {
    let mut out = Vec::with_capacity(ops.len());
    let mut i = 0;
    let mut j = 0;
    let mut shift: isize = 0;

    while j < ops.len() {
        let b = &ops[j];
        if b.is_noop() {
            out.push(b.clone());
            j += 1;
            continue;
        }

        match applied.get(i) {
            Some(a) if a.is_noop() => i += 1,
            Some(a) if a.location < b.location => {
                shift += match a.kind {
                    OpKind::Add => 1,
                    _ => -1,
                };
                i += 1;
            }
            Some(a) if a.location == b.location => {
                if a.kind == OpKind::Delete && b.kind == OpKind::Delete {
                    out.push(Op {
                        kind: OpKind::Noop,
                        ..b.clone()
                    });
                    shift -= 1;
                    i += 1;
                    j += 1;
                } else if a.kind == OpKind::Add {
                    shift += 1;
                    i += 1;
                } else {
                    out.push(b.shifted(shift));
                    j += 1;
                }
            }
            _ => {
                out.push(b.shifted(shift));
                j += 1;
            }
        }
    }

    out
}

/// Map a selection through the effect of `batch`.
///
/// Ops at or after the selection's end cannot move it, so iteration stops
/// at the first one.
pub fn apply_pos(pos: Selection, batch: &[Op]) -> Selection {
    let mut res = pos;
    for op in batch {
        if op.is_noop() {
            continue;
        }
        if op.location >= pos.end {
            break;
        }

        match op.kind {
            OpKind::Add => {
                if pos.start >= op.location {
                    res.start += 1;
                }
                res.end += 1;
            }
            OpKind::Delete => {
                if pos.start > op.location {
                    res.start = res.start.saturating_sub(1);
                }
                res.end = res.end.saturating_sub(1);
            }
            OpKind::Noop => {}
        }
    }
    res
}
