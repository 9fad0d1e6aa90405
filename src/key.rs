//! Internal key codec and ordering.
//!
//! An internal key is the user key followed by an 8-byte little-endian
//! trailer packing `(sequence << 8) | kind`. Keys sort by user key
//! ascending, then sequence descending, then kind descending, so the newest
//! version of a user key is encountered first during a merge. A zero-length
//! user key is valid and distinct from an absent key.

use std::{cmp::Ordering, fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Highest sequence number an internal key can carry (`2^56 - 1`). Also the
/// per-user-key sentinel used by the merge before the first version of a
/// key has been emitted.
pub const MAX_SEQ: u64 = (1 << 56) - 1;

const TRAILER_LEN: usize = 8;

/// Discriminates live values from deletion tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyKind {
    /// A deletion tombstone.
    Deletion = 0,
    /// A live value.
    Value = 1,
}

impl KeyKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(KeyKind::Deletion),
            1 => Some(KeyKind::Value),
            _ => None,
        }
    }
}

/// Borrowed view of a decoded internal key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedIkey<'a> {
    /// The user-key portion. May be empty.
    pub ukey: &'a [u8],
    /// Sequence number at which the entry was written.
    pub seq: u64,
    /// Value or deletion.
    pub kind: KeyKind,
}

/// Build an internal key from its parts.
pub fn ikey(ukey: &[u8], seq: u64, kind: KeyKind) -> Bytes {
    debug_assert!(seq <= MAX_SEQ);
    let mut buf = BytesMut::with_capacity(ukey.len() + TRAILER_LEN);
    buf.put_slice(ukey);
    buf.put_u64_le((seq << 8) | kind as u64);
    buf.freeze()
}

/// Decode an internal key.
///
/// Fails with a corruption error when the key is shorter than its trailer
/// or carries an unknown kind byte.
pub fn parse_ikey(ikey: &[u8]) -> Result<ParsedIkey<'_>, Error> {
    if ikey.len() < TRAILER_LEN {
        return Err(Error::corrupted(format!(
            "internal key too short: {} bytes",
            ikey.len()
        )));
    }
    let (ukey, trailer) = ikey.split_at(ikey.len() - TRAILER_LEN);
    let mut raw = [0u8; TRAILER_LEN];
    raw.copy_from_slice(trailer);
    let num = u64::from_le_bytes(raw);
    let kind = KeyKind::from_u8((num & 0xff) as u8)
        .ok_or_else(|| Error::corrupted(format!("unknown key kind {}", num & 0xff)))?;
    Ok(ParsedIkey {
        ukey,
        seq: num >> 8,
        kind,
    })
}

/// The user-key prefix of an internal key, without decoding the trailer.
///
/// Keys shorter than the trailer yield an empty slice; callers that need to
/// detect that case use [`parse_ikey`].
pub fn ukey(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len().saturating_sub(TRAILER_LEN)]
}

/// Total order over user keys.
pub trait UserComparator: Send + Sync {
    /// Compare two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte-order comparator, the default for user keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl UserComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Orders internal keys by user key ascending, then sequence descending,
/// then kind descending.
#[derive(Clone)]
pub struct InternalComparator {
    ucmp: Arc<dyn UserComparator>,
}

impl InternalComparator {
    /// Wrap a user comparator.
    pub fn new(ucmp: Arc<dyn UserComparator>) -> Self {
        Self { ucmp }
    }

    /// Compare two user keys.
    pub fn ucompare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.ucmp.compare(a, b)
    }

    /// Compare two internal keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.ucmp.compare(ukey(a), ukey(b)) {
            Ordering::Equal => trailer_num(b).cmp(&trailer_num(a)),
            ord => ord,
        }
    }
}

impl Default for InternalComparator {
    fn default() -> Self {
        Self::new(Arc::new(BytewiseComparator))
    }
}

impl fmt::Debug for InternalComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalComparator").finish_non_exhaustive()
    }
}

fn trailer_num(ikey: &[u8]) -> u64 {
    if ikey.len() < TRAILER_LEN {
        return 0;
    }
    let mut raw = [0u8; TRAILER_LEN];
    raw.copy_from_slice(&ikey[ikey.len() - TRAILER_LEN..]);
    u64::from_le_bytes(raw)
}
