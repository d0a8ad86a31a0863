use lazy_static::lazy_static;
use ndarray::{s, Array1, Array2, Array3};
use serde::Deserialize;

use crate::{
    chunks::Chunk,
    errors::{ReadError, ReadResult},
};

pub const BASE_PADDING: u8 = 0;
const NUM_BASES: usize = 4;

lazy_static! {
    pub(crate) static ref BASES_MAP: [u8; 128] = {
        let mut map = [BASE_PADDING; 128];
        map[b'A' as usize] = 1;
        map[b'C' as usize] = 2;
        map[b'G' as usize] = 3;
        map[b'T' as usize] = 4;
        map[b'a' as usize] = 1;
        map[b'c' as usize] = 2;
        map[b'g' as usize] = 3;
        map[b't' as usize] = 4;
        map
    };
}

fn encode_base(b: u8) -> u8 {
    BASES_MAP.get(b as usize).copied().unwrap_or(BASE_PADDING)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeqJustify {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetParams {
    pub chunk_context: (usize, usize),
    pub kmer_context_bases: (usize, usize),
    pub max_seq_len: usize,
    pub batch_size: usize,
    pub seq_justify: SeqJustify,
    pub drop_last: bool,
}

impl DatasetParams {
    fn chunk_len(&self) -> usize {
        self.chunk_context.0 + self.chunk_context.1
    }

    fn kmer_len(&self) -> usize {
        self.kmer_context_bases.0 + self.kmer_context_bases.1 + 1
    }
}

pub struct BatchDataset {
    params: DatasetParams,
    capacity: usize,
    chunks: Vec<Chunk>,
}

impl BatchDataset {
    pub fn new(capacity: usize, params: DatasetParams) -> Self {
        BatchDataset {
            params,
            capacity,
            chunks: Vec::with_capacity(capacity),
        }
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> ReadResult<()> {
        if self.chunks.len() >= self.capacity {
            return Err(ReadError::BatchFull {
                capacity: self.capacity,
            });
        }
        if chunk.signal.len() != self.params.chunk_len()
            || chunk.seq_len() > self.params.max_seq_len
        {
            return Err(ReadError::IncompleteRead("chunk does not fit dataset"));
        }

        self.chunks.push(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn seal(self) -> SealedDataset {
        let n = self.chunks.len();
        let bs = self.params.batch_size.max(1);
        let num_batches = if self.params.drop_last {
            n / bs
        } else {
            (n + bs - 1) / bs
        };

        SealedDataset {
            params: self.params,
            chunks: self.chunks,
            num_batches,
        }
    }
}

pub struct SealedDataset {
    params: DatasetParams,
    chunks: Vec<Chunk>,
    num_batches: usize,
}

impl SealedDataset {
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        let bs = self.params.batch_size.max(1);
        self.chunks
            .chunks(bs)
            .take(self.num_batches)
            .map(|chunks| collate(chunks, &self.params))
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    // [B, 1, chunk_len]
    pub signals: Array3<f32>,
    // [B, max_len + kmer_len - 1], base codes with k-mer context
    pub seqs: Array2<u8>,
    // [B, max_len + 1]
    pub seq_maps: Array2<usize>,
    pub seq_lens: Array1<usize>,
    pub labels: Array1<i64>,
    pub read_ids: Vec<String>,
    pub read_positions: Vec<usize>,
    pub kmer_context_bases: (usize, usize),
    pub seq_justify: SeqJustify,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.read_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_positions.is_empty()
    }

    fn kmer_len(&self) -> usize {
        self.kmer_context_bases.0 + self.kmer_context_bases.1 + 1
    }

    fn justify_offset(&self, idx: usize) -> usize {
        match self.seq_justify {
            SeqJustify::Left => 0,
            SeqJustify::Right => self.seq_maps.ncols() - 1 - self.seq_lens[idx],
        }
    }

    /// One-hot k-mer of the base each signal sample belongs to.
    ///
    /// Shape [B, 4 * kmer_len, chunk_len]. Padding and `N` stay all zeros.
    pub fn encode_kmers(&self) -> Array3<f32> {
        let kmer_len = self.kmer_len();
        let chunk_len = self.signals.shape()[2];
        let mut encoded = Array3::zeros((self.len(), NUM_BASES * kmer_len, chunk_len));

        for idx in 0..self.len() {
            let offset = self.justify_offset(idx);
            for b in 0..self.seq_lens[idx] {
                let start = self.seq_maps[[idx, offset + b]];
                let end = self.seq_maps[[idx, offset + b + 1]];
                if start == end {
                    continue;
                }

                for k in 0..kmer_len {
                    let code = self.seqs[[idx, offset + b + k]];
                    if code == BASE_PADDING {
                        continue;
                    }

                    let channel = k * NUM_BASES + (code - 1) as usize;
                    encoded.slice_mut(s![idx, channel, start..end]).fill(1.);
                }
            }
        }

        encoded
    }
}

fn collate(batch: &[Chunk], params: &DatasetParams) -> Batch {
    // Longest sequence in this batch
    let max_len = batch.iter().map(|c| c.seq_len()).max().unwrap_or(0);
    let kmer_len = params.kmer_len();
    let chunk_len = params.chunk_len();

    let mut signals = Array3::zeros((batch.len(), 1, chunk_len));
    let mut seqs = Array2::from_elem((batch.len(), max_len + kmer_len - 1), BASE_PADDING);
    let mut seq_maps = Array2::zeros((batch.len(), max_len + 1));
    let mut seq_lens = Array1::zeros(batch.len());
    let mut labels = Array1::zeros(batch.len());
    let mut read_ids = Vec::with_capacity(batch.len());
    let mut read_positions = Vec::with_capacity(batch.len());

    for (idx, chunk) in batch.iter().enumerate() {
        let l = chunk.seq_len();
        let offset = match params.seq_justify {
            SeqJustify::Left => 0,
            SeqJustify::Right => max_len - l,
        };

        signals
            .slice_mut(s![idx, 0, ..])
            .assign(&Array1::from_vec(chunk.signal.clone()));

        for (i, &b) in chunk.seq_with_context.iter().enumerate() {
            seqs[[idx, offset + i]] = encode_base(b);
        }
        for (i, &s) in chunk.seq_to_sig.iter().enumerate() {
            seq_maps[[idx, offset + i]] = s;
        }

        seq_lens[idx] = l;
        labels[idx] = chunk.label;
        read_ids.push(chunk.read_id.clone());
        read_positions.push(chunk.read_focus_base);
    }

    Batch {
        signals,
        seqs,
        seq_maps,
        seq_lens,
        labels,
        read_ids,
        read_positions,
        kmer_context_bases: params.kmer_context_bases,
        seq_justify: params.seq_justify,
    }
}
