use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte block identifier, chain-agnostic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Immutable chain-position descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub height: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    /// Block timestamp in milliseconds.
    pub timestamp: u64,
}

/// Types that expose the header of the chain position they were fetched at.
pub trait HasHeader {
    fn header(&self) -> &Header;
}

impl HasHeader for Header {
    fn header(&self) -> &Header {
        self
    }
}

/// Chain-specific payload plus its header, produced by the fetch stage.
///
/// A fetched block is exclusively owned by whichever queue currently holds it;
/// it is either handed to the process stage or dropped by a flush, never both.
#[derive(Debug, Clone)]
pub struct FetchedBlock<B> {
    header: Header,
    payload: B,
}

impl<B> FetchedBlock<B> {
    pub fn new(header: Header, payload: B) -> Self {
        Self { header, payload }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn payload(&self) -> &B {
        &self.payload
    }

    pub fn into_payload(self) -> B {
        self.payload
    }
}

impl<B> HasHeader for FetchedBlock<B> {
    fn header(&self) -> &Header {
        &self.header
    }
}

/// A unit of work accepted by `enqueue_blocks`: either a bare height still to
/// be fetched, or an already-fetched block (bypass and test paths).
#[derive(Debug)]
pub enum QueueEntry<B> {
    Height(u64),
    Block(FetchedBlock<B>),
}

impl<B> QueueEntry<B> {
    pub fn height(&self) -> u64 {
        match self {
            QueueEntry::Height(height) => *height,
            QueueEntry::Block(block) => block.height(),
        }
    }
}

impl<B> From<u64> for QueueEntry<B> {
    fn from(height: u64) -> Self {
        QueueEntry::Height(height)
    }
}

/// Outcome of running a block through the handler executor.
///
/// A non-`None` `reindex_target` means the handler discovered that a rewind is
/// required before indexing can continue past this block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessResult {
    pub dynamic_datasource_created: bool,
    pub reindex_target: Option<Header>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_hash(seed: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        BlockHash(bytes)
    }

    fn make_header(height: u64) -> Header {
        Header {
            height,
            hash: dummy_hash(height as u8),
            parent_hash: dummy_hash(height.wrapping_sub(1) as u8),
            timestamp: 1_000 + height,
        }
    }

    #[test]
    fn queue_entry_reports_height_for_both_variants() {
        let bare: QueueEntry<()> = QueueEntry::Height(7);
        assert_eq!(bare.height(), 7);

        let fetched = QueueEntry::Block(FetchedBlock::new(make_header(9), ()));
        assert_eq!(fetched.height(), 9);
    }

    #[test]
    fn block_hash_displays_as_hex() {
        let hash = dummy_hash(0xab);
        assert!(hash.to_string().starts_with("ab00"));
        assert_eq!(hash.to_string().len(), 64);
    }

    #[test]
    fn fetched_block_surrenders_payload() {
        let block = FetchedBlock::new(make_header(3), vec![1u8, 2, 3]);
        assert_eq!(block.header().height, 3);
        assert_eq!(block.into_payload(), vec![1, 2, 3]);
    }
}
