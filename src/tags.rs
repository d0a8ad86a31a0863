use bio::alphabets::dna;
use itertools::Itertools;
use ndarray::ArrayView2;
use noodles::sam::alignment::{
    record::data::field::Tag,
    record_buf::data::field::{value::Array, Value},
    RecordBuf,
};

use crate::{
    errors::{ReadError, ReadResult},
    read::Strand,
};

pub const MOD_POSITIONS_TAG: [u8; 2] = *b"MM";
pub const MOD_PROBS_TAG: [u8; 2] = *b"ML";
const LEGACY_TAGS: [[u8; 2]; 2] = [*b"Mm", *b"Ml"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModTags {
    pub mm: String,
    pub ml: Vec<u8>,
}

impl ModTags {
    pub fn append(&mut self, other: ModTags) {
        self.mm.push_str(&other.mm);
        self.ml.extend(other.ml);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModCalls {
    pub can_base: u8,
    pub strand: Strand,
    pub mod_base: u8,
    pub positions: Vec<usize>,
    pub probs: Vec<f32>,
}

pub struct DeltaListConverter {
    cumulative_counts: Vec<u32>,
    base: u8,
}

impl DeltaListConverter {
    pub fn new(seq: &[u8], base: u8) -> Self {
        let cumulative_counts = seq
            .iter()
            .scan(0, |count, &nt| {
                if nt.to_ascii_uppercase() == base {
                    *count += 1;
                }
                Some(*count)
            })
            .collect();

        DeltaListConverter {
            cumulative_counts,
            base,
        }
    }

    pub fn to_delta_list(&self, seq: &[u8], positions: &[usize]) -> ReadResult<Vec<u32>> {
        let mut last = 0;
        let mut deltas = Vec::with_capacity(positions.len());
        for &pos in positions {
            match seq.get(pos) {
                Some(nt) if nt.to_ascii_uppercase() == self.base => (),
                _ => return Err(ReadError::NonCanonicalFocus),
            }

            let count = self.cumulative_counts[pos];
            deltas.push(count - last - 1);
            last = count;
        }

        Ok(deltas)
    }

    pub fn to_positions(&self, deltas: &[u32]) -> ReadResult<Vec<usize>> {
        let mut finger = 0usize;
        let mut n_skips = 0u32;
        let mut positions = Vec::with_capacity(deltas.len());
        for d in deltas {
            loop {
                match self.cumulative_counts.get(finger) {
                    Some(&count) if count <= d + n_skips => finger += 1,
                    Some(_) => break,
                    None => return Err(ReadError::MalformedTag("MM")),
                }
            }

            positions.push(finger);
            n_skips += d + 1;
        }

        Ok(positions)
    }
}

#[inline]
pub fn prob_to_qual(prob: f32) -> u8 {
    if prob >= 1. {
        255
    } else if prob <= 0. {
        0
    } else {
        (prob * 256.).floor().min(255.) as u8
    }
}

#[inline]
pub fn qual_to_prob(qual: u8) -> f32 {
    (qual as f32 + 0.5) / 256.
}

fn counted_base(can_base: u8, strand: Strand) -> u8 {
    match strand {
        Strand::Forward => can_base,
        Strand::Reverse => dna::complement(can_base),
    }
}

/// Builds the MM/ML pair for focus `positions` on the forward `seq`.
///
/// `probs` has one row per position and one column per modified base. Each
/// modified base gets its own `;`-terminated group, ML bytes follow the same
/// group order.
pub fn format_mm_ml_tags(
    seq: &[u8],
    positions: &[usize],
    probs: ArrayView2<f32>,
    mod_bases: &[u8],
    can_base: u8,
    strand: Strand,
) -> ReadResult<ModTags> {
    if probs.nrows() != positions.len() || probs.ncols() != mod_bases.len() {
        return Err(ReadError::MalformedTag("ML"));
    }

    let order: Vec<_> = (0..positions.len())
        .sorted_by_key(|&i| positions[i])
        .collect();
    let sorted_positions: Vec<_> = order.iter().map(|&i| positions[i]).collect();

    let converter = DeltaListConverter::new(seq, counted_base(can_base, strand));
    let deltas = converter.to_delta_list(seq, &sorted_positions)?;

    let mut tags = ModTags::default();
    for (mod_idx, &mod_base) in mod_bases.iter().enumerate() {
        tags.mm.push(can_base as char);
        tags.mm.push_str(&strand.to_string());
        tags.mm.push(mod_base as char);
        tags.mm.push('?');
        for d in deltas.iter() {
            tags.mm.push(',');
            tags.mm.push_str(&d.to_string());
        }
        tags.mm.push(';');

        tags.ml
            .extend(order.iter().map(|&i| prob_to_qual(probs[[i, mod_idx]])));
    }

    Ok(tags)
}

pub fn parse_mm_ml_tags(seq: &[u8], tags: &ModTags) -> ReadResult<Vec<ModCalls>> {
    let mut calls = Vec::new();
    let mut ml = tags.ml.iter();

    for group in tags.mm.split(';').filter(|g| !g.is_empty()) {
        let mut fields = group.split(',');
        let header = fields.next().unwrap_or_default().as_bytes();
        if header.len() < 3 {
            return Err(ReadError::MalformedTag("MM"));
        }

        let can_base = header[0];
        let strand = match header[1] {
            b'+' => Strand::Forward,
            b'-' => Strand::Reverse,
            _ => return Err(ReadError::MalformedTag("MM")),
        };
        let mod_codes: Vec<u8> = header[2..]
            .iter()
            .copied()
            .filter(|&c| c != b'?' && c != b'.')
            .collect();
        if mod_codes.is_empty() {
            return Err(ReadError::MalformedTag("MM"));
        }

        let deltas = fields
            .map(|d| d.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ReadError::MalformedTag("MM"))?;

        let converter = if can_base == b'N' {
            DeltaListConverter::new(&vec![b'N'; seq.len()], b'N')
        } else {
            DeltaListConverter::new(seq, counted_base(can_base, strand))
        };
        let positions = converter.to_positions(&deltas)?;

        let mut group_calls: Vec<_> = mod_codes
            .iter()
            .map(|&mod_base| ModCalls {
                can_base,
                strand,
                mod_base,
                positions: positions.clone(),
                probs: Vec::with_capacity(positions.len()),
            })
            .collect();

        // Multi-code groups interleave codes per position
        for _ in 0..positions.len() {
            for call in group_calls.iter_mut() {
                let qual = ml.next().ok_or(ReadError::MalformedTag("ML"))?;
                call.probs.push(qual_to_prob(*qual));
            }
        }

        calls.extend(group_calls);
    }

    if ml.next().is_some() {
        return Err(ReadError::MalformedTag("ML"));
    }

    Ok(calls)
}

pub fn mod_tags_from_record(record: &RecordBuf) -> ReadResult<Option<ModTags>> {
    let mm = match record.data().get(&Tag::from(MOD_POSITIONS_TAG)) {
        Some(Value::String(mm)) => mm.to_string(),
        Some(_) => return Err(ReadError::MalformedTag("MM")),
        None => return Ok(None),
    };
    let ml = match record.data().get(&Tag::from(MOD_PROBS_TAG)) {
        Some(Value::Array(Array::UInt8(ml))) => ml.clone(),
        None => Vec::new(),
        Some(_) => return Err(ReadError::MalformedTag("ML")),
    };

    Ok(Some(ModTags { mm, ml }))
}

pub fn rewrite_mod_tags(record: &mut RecordBuf, tags: &ModTags) {
    let data = record.data_mut();
    for tag in [MOD_POSITIONS_TAG, MOD_PROBS_TAG]
        .iter()
        .chain(LEGACY_TAGS.iter())
    {
        data.remove(&Tag::from(*tag));
    }

    data.insert(
        Tag::from(MOD_POSITIONS_TAG),
        Value::String(tags.mm.as_str().into()),
    );
    data.insert(
        Tag::from(MOD_PROBS_TAG),
        Value::Array(Array::UInt8(tags.ml.clone())),
    );
}
