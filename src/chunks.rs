use anyhow::{bail, Result};
use lazy_static::lazy_static;

use crate::errors::{ReadError, ReadResult};

pub const PAD_BASE: u8 = b'N';

lazy_static! {
    // IUPAC nucleotide codes as bit sets over A, C, G, T.
    pub(crate) static ref IUPAC_MASKS: [u8; 128] = {
        let mut masks = [0; 128];
        for (code, mask) in [
            (b'A', 0b0001),
            (b'C', 0b0010),
            (b'G', 0b0100),
            (b'T', 0b1000),
            (b'U', 0b1000),
            (b'R', 0b0101),
            (b'Y', 0b1010),
            (b'S', 0b0110),
            (b'W', 0b1001),
            (b'K', 0b1100),
            (b'M', 0b0011),
            (b'B', 0b1110),
            (b'D', 0b1101),
            (b'H', 0b1011),
            (b'V', 0b0111),
            (b'N', 0b1111),
        ] {
            masks[code as usize] = mask;
            masks[code.to_ascii_lowercase() as usize] = mask;
        }
        masks
    };
}

fn iupac_mask(b: u8) -> u8 {
    IUPAC_MASKS.get(b as usize).copied().unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Motif {
    raw: Vec<u8>,
    focus_pos: usize,
}

impl Motif {
    pub fn new(raw: &str, focus_pos: usize) -> Result<Self> {
        let raw = raw.as_bytes().to_ascii_uppercase();
        if raw.is_empty() {
            bail!("Empty motif");
        }
        if focus_pos >= raw.len() {
            bail!(
                "Motif focus position {} outside of motif {}",
                focus_pos,
                String::from_utf8_lossy(&raw)
            );
        }
        if let Some(&b) = raw.iter().find(|&&b| iupac_mask(b) == 0) {
            bail!("Invalid base {} in motif", b as char);
        }

        Ok(Motif { raw, focus_pos })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn focus_pos(&self) -> usize {
        self.focus_pos
    }

    pub fn can_base(&self) -> u8 {
        self.raw[self.focus_pos]
    }

    pub fn any_context(&self) -> bool {
        self.raw.len() == 1
    }

    pub fn matches_at(&self, seq: &[u8], pos: usize) -> bool {
        if pos < self.focus_pos || pos - self.focus_pos + self.raw.len() > seq.len() {
            return false;
        }

        let start = pos - self.focus_pos;
        seq[start..start + self.raw.len()]
            .iter()
            .zip(self.raw.iter())
            .all(|(&s, &m)| {
                let s = iupac_mask(s);
                s != 0 && s & iupac_mask(m) == s
            })
    }

    pub fn find_focus_bases(&self, seq: &[u8]) -> Vec<usize> {
        (0..seq.len())
            .filter(|&pos| self.matches_at(seq, pos))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_context: (usize, usize),
    pub kmer_context_bases: (usize, usize),
    pub base_start_justify: bool,
    pub offset: isize,
}

impl ChunkParams {
    pub fn chunk_len(&self) -> usize {
        self.chunk_context.0 + self.chunk_context.1
    }

    pub fn kmer_len(&self) -> usize {
        self.kmer_context_bases.0 + self.kmer_context_bases.1 + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub signal: Vec<f32>,
    pub seq_with_context: Vec<u8>,
    // Start of every core base within the window, plus the window end.
    pub seq_to_sig: Vec<usize>,
    pub kmer_context_bases: (usize, usize),
    pub focus_base: usize,
    pub read_focus_base: usize,
    pub read_id: String,
    pub label: i64,
}

impl Chunk {
    pub const UNLABELED: i64 = -1;

    pub fn seq_len(&self) -> usize {
        self.seq_to_sig.len() - 1
    }

    pub fn core_seq(&self) -> &[u8] {
        let start = self.kmer_context_bases.0;
        &self.seq_with_context[start..start + self.seq_len()]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRead {
    pub read_id: String,
    pub signal: Vec<f32>,
    pub seq_to_sig: Vec<usize>,
    pub seq: Vec<u8>,
    pub focus_bases: Vec<usize>,
}

impl CanonicalRead {
    pub fn new(
        read_id: String,
        signal: Vec<f32>,
        seq_to_sig: Vec<usize>,
        seq: Vec<u8>,
    ) -> ReadResult<Self> {
        let consistent = seq_to_sig.len() == seq.len() + 1
            && seq_to_sig.first() == Some(&0)
            && seq_to_sig.last() == Some(&signal.len())
            && seq_to_sig.windows(2).all(|w| w[0] <= w[1]);
        if !consistent {
            return Err(ReadError::IncompleteRead("inconsistent coordinate map"));
        }

        Ok(CanonicalRead {
            read_id,
            signal,
            seq_to_sig,
            seq,
            focus_bases: Vec::new(),
        })
    }

    pub fn add_motif_focus_bases(&mut self, motifs: &[Motif]) {
        for motif in motifs {
            let hits = motif.find_focus_bases(&self.seq);
            self.focus_bases.extend(hits);
        }

        self.focus_bases.sort_unstable();
        self.focus_bases.dedup();
    }

    pub fn set_focus_bases(&mut self, mut focus_bases: Vec<usize>) {
        focus_bases.retain(|&p| p < self.seq.len());
        focus_bases.sort_unstable();
        focus_bases.dedup();
        self.focus_bases = focus_bases;
    }

    pub fn extract_chunk(&self, focus_base: usize, params: &ChunkParams) -> Option<Chunk> {
        if focus_base >= self.seq.len() {
            return None;
        }

        let map = &self.seq_to_sig;
        let focus_sig = if params.base_start_justify {
            map[focus_base]
        } else {
            (map[focus_base] + map[focus_base + 1]) / 2
        };
        let focus_sig = focus_sig as isize + params.offset;

        let sig_start = focus_sig - params.chunk_context.0 as isize;
        let sig_end = focus_sig + params.chunk_context.1 as isize;
        if sig_start < 0 || sig_end > self.signal.len() as isize {
            return None;
        }
        let (sig_start, sig_end) = (sig_start as usize, sig_end as usize);

        // bases overlapping [sig_start, sig_end)
        let seq_start = map.partition_point(|&s| s <= sig_start) - 1;
        let seq_end = map.partition_point(|&s| s < sig_end).max(seq_start + 1);

        let chunk_len = sig_end - sig_start;
        let seq_to_sig = map[seq_start..=seq_end]
            .iter()
            .map(|&s| s.saturating_sub(sig_start).min(chunk_len))
            .collect();

        let (before, after) = params.kmer_context_bases;
        let seq_with_context = (seq_start as isize - before as isize
            ..(seq_end + after) as isize)
            .map(|i| {
                usize::try_from(i)
                    .ok()
                    .and_then(|i| self.seq.get(i).copied())
                    .unwrap_or(PAD_BASE)
            })
            .collect();

        Some(Chunk {
            signal: self.signal[sig_start..sig_end].to_vec(),
            seq_with_context,
            seq_to_sig,
            kmer_context_bases: params.kmer_context_bases,
            focus_base: focus_base - seq_start,
            read_focus_base: focus_base,
            read_id: self.read_id.clone(),
            label: Chunk::UNLABELED,
        })
    }

    pub fn iter_chunks<'a>(&'a self, params: &'a ChunkParams) -> impl Iterator<Item = Chunk> + 'a {
        self.focus_bases
            .iter()
            .filter_map(move |&p| self.extract_chunk(p, params))
    }
}
