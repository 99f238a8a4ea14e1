//! Shared data model: extents, block sizes, stream statistics.

/// Sectors per thin-pool data block (each sector is 512 bytes).
///
/// All byte offsets and lengths carried on the wire are multiples of
/// `block_size.bytes()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize(u64);

impl BlockSize {
    pub const SECTOR_BYTES: u64 = 512;

    /// Builds a block size from a sector count. Zero is rejected: every
    /// extent must translate to a non-empty byte range.
    pub fn new(sectors: u64) -> Option<Self> {
        if sectors == 0 { None } else { Some(Self(sectors)) }
    }

    pub fn sectors(self) -> u64 {
        self.0
    }

    /// Bytes per thin-pool data block.
    pub fn bytes(self) -> u64 {
        self.0 * Self::SECTOR_BYTES
    }
}

/// Whether an extent must be read from the source and transmitted, or marked
/// as a hole on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    DataPresent,
    DataAbsent,
}

/// A contiguous run of thin-pool blocks, in block-size units (not bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub begin_block: u64,
    pub length_blocks: u64,
    pub kind: ExtentKind,
}

impl Extent {
    pub fn new(begin_block: u64, length_blocks: u64, kind: ExtentKind) -> Self {
        Self { begin_block, length_blocks, kind }
    }

    /// Absolute byte offset of this extent's start, given the pool's block size.
    pub fn byte_offset(&self, block_size: BlockSize) -> u64 {
        self.begin_block * block_size.bytes()
    }

    /// Byte length of this extent, given the pool's block size.
    pub fn byte_length(&self, block_size: BlockSize) -> u64 {
        self.length_blocks * block_size.bytes()
    }
}

/// Identifies a thin-provisioned volume for one send/receive invocation.
///
/// Immutable after discovery; discovery itself is delegated to a
/// volume-manager query collaborator outside this crate (see the CLI crate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub vg_name: String,
    pub lv_name: String,
    pub pool_name: String,
    pub dm_path: String,
    pub thin_id: u32,
    pub active: bool,
}

/// Running (sender) or expected (receiver) stream statistics.
///
/// `n_chunks` seeds at 2 on the sender (it counts both markers before any
/// extent chunk is emitted); the receiver increments it on every header read,
/// including the two markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub n_chunks: u64,
    pub n_data: u64,
    pub n_unmap: u64,
}

impl StreamStats {
    pub fn new_for_send() -> Self {
        Self { n_chunks: 2, n_data: 0, n_unmap: 0 }
    }
}
