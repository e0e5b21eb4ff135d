use crate::digest::Digest;

/// The largest segment object stores accept.
pub const MAX_CHUNK_SIZE: u64 = 5 * 1000 * 1000 * 1000;

/// One unit of work flowing through the upload pipeline.
///
/// Chunks start out with only their position in the file. Stages fill in the
/// object identity, the bytes, and the digest; the bytes are dropped again as
/// soon as the chunk is durable.
#[derive(Debug, Default)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    pub object: String,
    pub container: String,
    pub data: Option<Vec<u8>>,
    pub digest: Option<Digest>,
    /// Already present at the destination; never read or uploaded.
    pub skipped: bool,
}

impl Chunk {
    pub fn new(index: u64, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            ..Default::default()
        }
    }

    /// The `<container>/<object>` path manifests refer to.
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.object)
    }
}

/// Fixed-size chunk boundaries for a file.
///
/// An empty file has no chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// `None` for a zero chunk size.
    pub fn new(file_size: u64, chunk_size: u64) -> Option<Self> {
        (chunk_size > 0).then_some(Self {
            file_size,
            chunk_size,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Size of the chunk at `index`, or `None` past the end of the file.
    pub fn size_of(&self, index: u64) -> Option<u64> {
        let offset = index.checked_mul(self.chunk_size)?;
        if offset >= self.file_size {
            return None;
        }
        Some((self.file_size - offset).min(self.chunk_size))
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> {
        let plan = *self;
        (0..plan.count()).map(move |index| {
            let offset = index * plan.chunk_size;
            let size = (plan.file_size - offset).min(plan.chunk_size);
            Chunk::new(index, offset, size)
        })
    }
}

/// Maximum chunks representable with two manifest levels of `limit` entries.
pub fn max_chunks(segment_limit: u64) -> u64 {
    segment_limit.saturating_mul(segment_limit)
}
