/// One chunk: an ordered run of flushed blocks, published as a single
/// immutable object. `size` is the byte sum of the blocks.
struct Chunk {
    blocks: Vec<Vec<u8>>,
    size: u64,
}

impl Chunk {
    fn from_block(block: Vec<u8>) -> Self {
        let size = block.len() as u64;
        Self {
            blocks: vec![block],
            size,
        }
    }

    fn absorb(&mut self, other: Chunk) {
        self.blocks.extend(other.blocks);
        self.size += other.size;
    }

    fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }
}

/// What a [`ChunkList::push_block`] asks the caller to publish: the bytes
/// of the (possibly merged) last chunk under its absolute range, plus the
/// size vector for the manifest. Only the last chunk ever changes, so one
/// object write per flush is always enough.
pub struct ChunkWrite {
    pub start: u64,
    pub end: u64,
    pub data: Vec<u8>,
    pub sizes: Vec<u64>,
}

impl ChunkWrite {
    pub fn suffix(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

/// The logarithmic chunk layout. Blocks arrive one per flush; each starts
/// as its own chunk, and while the last two chunks hold the same number
/// of blocks they merge, as in the 2048 game. Block counts front to back
/// are therefore strictly decreasing powers of two, which caps the chunk
/// count at log2(n)+1 and the total republished bytes at O(n log n).
#[derive(Default)]
pub struct ChunkList {
    chunks: Vec<Chunk>,
    total: u64,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes flushed so far (sum of all chunk sizes).
    pub fn flushed_len(&self) -> u64 {
        self.total
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.chunks.iter().map(|c| c.size).collect()
    }

    /// Append a block and run the merge rule. The returned write covers
    /// exactly the last chunk; its range extends a previously published
    /// range only forward (same `start`, larger `end`), never backward.
    pub fn push_block(&mut self, block: Vec<u8>) -> ChunkWrite {
        self.total += block.len() as u64;
        self.chunks.push(Chunk::from_block(block));
        while self.chunks.len() >= 2 {
            let n = self.chunks.len();
            if self.chunks[n - 2].blocks.len() != self.chunks[n - 1].blocks.len() {
                break;
            }
            let newer = self.chunks.pop().unwrap();
            self.chunks.last_mut().unwrap().absorb(newer);
        }

        let last = self.chunks.last().unwrap();
        let end = self.total;
        let start = end - last.size;
        ChunkWrite {
            start,
            end,
            data: last.concat(),
            sizes: self.sizes(),
        }
    }

    /// The whole flushed prefix, in order. Used at finalisation to build
    /// the consolidated object.
    pub fn concat_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total as usize);
        for chunk in &self.chunks {
            for block in &chunk.blocks {
                out.extend_from_slice(block);
            }
        }
        out
    }

    fn block_counts(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.blocks.len()).collect()
    }
}
