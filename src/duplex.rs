use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{bail, Context, Result};
use bio::{
    alignment::{pairwise::Aligner, AlignmentOperation},
    alphabets::dna::revcomp,
};
use crossbeam_channel::Sender;
use log::debug;

use crate::{
    alignments::AlignmentRecord,
    errors::{ErrorFlag, ReadError, ReadResult},
    mapping::{derive_ref_to_signal, CigarOp},
    read::Read,
    signal::{SignalRecord, SignalSource},
};

const MATCH_SCORE: i32 = 1;
const MISMATCH_SCORE: i32 = -1;
const GAP_OPEN: i32 = -5;
const GAP_EXTEND: i32 = -1;

/// Base level correspondence between a simplex read and a duplex sequence.
///
/// `cigar` describes the simplex span `simplex_start..simplex_end` (query)
/// against `trimmed_duplex_seq` (reference).
#[derive(Debug, Clone, PartialEq)]
pub struct SimplexDuplexMapping {
    pub simplex_start: usize,
    pub simplex_end: usize,
    pub duplex_offset: usize,
    pub trimmed_duplex_seq: Vec<u8>,
    pub cigar: Vec<CigarOp>,
}

fn push_op(cigar: &mut Vec<CigarOp>, op: CigarOp) {
    let merged = match (cigar.last(), op) {
        (Some(CigarOp::Match(l)), CigarOp::Match(n)) => CigarOp::Match(l + n),
        (Some(CigarOp::Insertion(l)), CigarOp::Insertion(n)) => CigarOp::Insertion(l + n),
        (Some(CigarOp::Deletion(l)), CigarOp::Deletion(n)) => CigarOp::Deletion(l + n),
        _ => {
            cigar.push(op);
            return;
        }
    };

    if let Some(last) = cigar.last_mut() {
        *last = merged;
    }
}

pub fn map_simplex_to_duplex(simplex_seq: &[u8], duplex_seq: &[u8]) -> SimplexDuplexMapping {
    let score = |a: u8, b: u8| if a == b { MATCH_SCORE } else { MISMATCH_SCORE };
    let mut aligner =
        Aligner::with_capacity(simplex_seq.len(), duplex_seq.len(), GAP_OPEN, GAP_EXTEND, &score);
    let alignment = aligner.local(simplex_seq, duplex_seq);

    let mut cigar = Vec::new();
    for op in &alignment.operations {
        match op {
            AlignmentOperation::Match | AlignmentOperation::Subst => {
                push_op(&mut cigar, CigarOp::Match(1))
            }
            // gap in the duplex sequence
            AlignmentOperation::Ins => push_op(&mut cigar, CigarOp::Insertion(1)),
            // gap in the simplex sequence
            AlignmentOperation::Del => push_op(&mut cigar, CigarOp::Deletion(1)),
            AlignmentOperation::Xclip(_) | AlignmentOperation::Yclip(_) => (),
        }
    }

    SimplexDuplexMapping {
        simplex_start: alignment.xstart,
        simplex_end: alignment.xend,
        duplex_offset: alignment.ystart,
        trimmed_duplex_seq: duplex_seq[alignment.ystart..alignment.yend].to_vec(),
        cigar,
    }
}

impl Read {
    /// Re-expresses this read in the coordinates of a duplex sequence.
    ///
    /// Returns the new read and its offset into the duplex sequence (in the
    /// orientation selected by `duplex_orientation`). Simplex bases outside the
    /// local alignment are dropped, reference fields are cleared.
    pub fn with_duplex_alignment(
        &self,
        duplex_alignment: &AlignmentRecord,
        duplex_orientation: bool,
    ) -> ReadResult<(Read, usize)> {
        if self.query_to_signal.len() != self.seq.len() + 1 {
            return Err(ReadError::MissingCoordinateMap);
        }

        let stored = duplex_alignment.query_sequence();
        if stored.is_empty() {
            return Err(ReadError::EmptyDuplexSequence);
        }
        let duplex_seq = if duplex_orientation {
            stored
        } else {
            revcomp(&stored)
        };

        let mapping = map_simplex_to_duplex(&self.seq, &duplex_seq);
        let duplex_to_signal = derive_ref_to_signal(
            &self.query_to_signal[mapping.simplex_start..=mapping.simplex_end],
            &mapping.cigar,
            &self.seq[mapping.simplex_start..mapping.simplex_end],
            &mapping.trimmed_duplex_seq,
        )?;

        let read = Read {
            read_id: self.read_id.clone(),
            signal: self.signal.clone(),
            num_trimmed: self.num_trimmed,
            seq: mapping.trimmed_duplex_seq,
            move_table: self.move_table.clone(),
            query_to_signal: duplex_to_signal,
            normalization: self.normalization,
            ref_pos: None,
            reference: None,
            alignment: duplex_alignment.clone(),
        };

        Ok((read, mapping.duplex_offset))
    }
}

/// `template` is the read running along the stored duplex sequence,
/// `complement` runs along its reverse complement.
#[derive(Debug, Clone)]
pub struct DuplexRead {
    pub duplex_read_id: String,
    pub duplex_alignment: AlignmentRecord,
    pub is_reverse_mapped: bool,
    pub template: Read,
    pub complement: Read,
    pub template_offset: usize,
    pub complement_offset: usize,
}

impl DuplexRead {
    pub fn from_reads_and_alignment(
        template: &Read,
        complement: &Read,
        duplex_alignment: AlignmentRecord,
    ) -> ReadResult<Self> {
        let duplex_read_id = duplex_alignment
            .read_id()
            .ok_or(ReadError::IncompleteRead("duplex record without name"))?;

        let is_reverse_mapped = duplex_alignment.is_reverse();
        let (forward, reverse) = if is_reverse_mapped {
            (complement, template)
        } else {
            (template, complement)
        };

        let (template, template_offset) = forward.with_duplex_alignment(&duplex_alignment, true)?;
        let (complement, complement_offset) =
            reverse.with_duplex_alignment(&duplex_alignment, false)?;

        Ok(DuplexRead {
            duplex_read_id,
            duplex_alignment,
            is_reverse_mapped,
            template,
            complement,
            template_offset,
            complement_offset,
        })
    }

    pub fn duplex_basecalled_sequence(&self) -> Vec<u8> {
        self.duplex_alignment.query_sequence()
    }
}

pub fn parse_pairs<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Cannot open pairs file {}", path.display()))?;

    let mut pairs = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate().skip(1) {
        let line = line.with_context(|| format!("Cannot read pairs file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let mut ids = line.split_whitespace();
        match (ids.next(), ids.next(), ids.next()) {
            (Some(template), Some(complement), None) => {
                pairs.push((template.to_owned(), complement.to_owned()))
            }
            _ => bail!("Malformed pair on line {} of {}", i + 1, path.display()),
        }
    }

    Ok(pairs)
}

pub fn duplex_read_name(template: &str, complement: &str) -> String {
    format!("{};{}", template, complement)
}

// Stage 1 of duplex mode: signals of both reads of every pair.
pub(crate) fn pair_signal_reader<S: SignalSource>(
    mut source: S,
    pairs: Vec<(String, String)>,
    sender: Sender<ReadResult<(SignalRecord, SignalRecord)>>,
    error_flag: &ErrorFlag,
) {
    for (template, complement) in pairs {
        if error_flag.is_set() {
            break;
        }

        let signals = source
            .read(&template)
            .and_then(|t| source.read(&complement).map(|c| (t, c)));
        if let Err(ref e) = signals {
            debug!("Cannot read signals of pair {} {}: {}", template, complement, e);
        }

        if sender.send(signals).is_err() {
            break;
        }
    }
}
