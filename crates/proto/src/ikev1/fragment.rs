//! IKE fragmentation reassembly
//!
//! A fragmented message arrives as a series of datagrams whose header
//! next-payload is the private-use fragmentation type. Each carries:
//!
//! ```text
//! +--------------+--------------+---------------+---------------+
//! | Next Payload |   RESERVED   |        Payload Length         |
//! +--------------+--------------+---------------+---------------+
//! |         Fragment ID         |  Fragment Num |     Flags     |
//! +--------------+--------------+---------------+---------------+
//! |                     Fragment Data                           |
//! +-------------------------------------------------------------+
//! ```
//!
//! Fragments are kept sorted by index; a duplicate index replaces the
//! buffer already held. Reassembly completes once a fragment with the
//! last-flag is present and every index from 1 up to it is filled; the
//! concatenation then re-enters the demultiplexer as one datagram.

use super::constants::MAX_FRAGMENT_INDEX;
use super::error::{Error, Result};

/// Flag bit marking the final fragment
const LAST_FRAGMENT_FLAG: u8 = 0x01;

/// One buffered fragment
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Fragment index, 1-based
    pub index: u8,
    /// This is the final fragment
    pub last: bool,
    /// Fragment data
    pub data: Vec<u8>,
}

/// Parsed fragment header plus its data
#[derive(Debug, Clone)]
pub struct FragmentPayload {
    /// Fragment series identifier
    pub id: u16,
    /// The fragment itself
    pub fragment: Fragment,
}

/// Parse a fragmentation payload occupying an entire message body
///
/// # Errors
///
/// Returns error when the payload length disagrees with the body, the
/// chained next-payload is not NONE, or the index is 0 or above 16 —
/// all of which the caller reports as PAYLOAD-MALFORMED.
pub fn parse_fragment(body: &[u8]) -> Result<FragmentPayload> {
    if body.len() < 8 {
        return Err(Error::BufferTooShort {
            required: 8,
            available: body.len(),
        });
    }
    let next_payload = body[0];
    let length = u16::from_be_bytes([body[2], body[3]]) as usize;
    let id = u16::from_be_bytes([body[4], body[5]]);
    let index = body[6];
    let flags = body[7];

    if length != body.len() {
        return Err(Error::InvalidLength {
            expected: body.len(),
            actual: length,
        });
    }
    if next_payload != 0 {
        return Err(Error::InvalidPayload(format!(
            "fragment chains next payload {}",
            next_payload
        )));
    }
    if index == 0 || index > MAX_FRAGMENT_INDEX {
        return Err(Error::InvalidPayload(format!(
            "fragment index {} out of range",
            index
        )));
    }

    Ok(FragmentPayload {
        id,
        fragment: Fragment {
            index,
            last: flags & LAST_FRAGMENT_FLAG != 0,
            data: body[8..].to_vec(),
        },
    })
}

/// Serialize a fragmentation payload (testing and fragment-capable replies)
pub fn emit_fragment(id: u16, index: u8, last: bool, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.push(0);
    out.push(0);
    out.extend_from_slice(&((8 + data.len()) as u16).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(index);
    out.push(if last { LAST_FRAGMENT_FLAG } else { 0 });
    out.extend_from_slice(data);
    out
}

/// Per-SA ordered fragment buffer
#[derive(Debug, Clone, Default)]
pub struct FragmentSet {
    frags: Vec<Fragment>,
}

impl FragmentSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fragment, keeping index order; a duplicate index
    /// replaces the previous buffer
    pub fn insert(&mut self, fragment: Fragment) {
        match self.frags.binary_search_by_key(&fragment.index, |f| f.index) {
            Ok(pos) => self.frags[pos] = fragment,
            Err(pos) => self.frags.insert(pos, fragment),
        }
    }

    /// Number of buffered fragments
    pub fn len(&self) -> usize {
        self.frags.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    /// Drop all buffered fragments
    pub fn clear(&mut self) {
        self.frags.clear();
    }

    /// Reassemble if complete: a last-flagged fragment exists and all
    /// indices from 1 to it are present
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        let last_index = self.frags.iter().find(|f| f.last)?.index;

        let mut expected = 1u8;
        let mut size = 0usize;
        for frag in &self.frags {
            if frag.index != expected {
                return None;
            }
            size += frag.data.len();
            if frag.index == last_index {
                let mut out = Vec::with_capacity(size);
                for f in &self.frags[..expected as usize] {
                    out.extend_from_slice(&f.data);
                }
                return Some(out);
            }
            expected += 1;
        }
        None
    }
}
