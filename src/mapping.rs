use log::debug;

use crate::errors::{Discordance, ReadError, ReadResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveTable {
    pub stride: usize,
    pub moves: Vec<u8>,
}

impl MoveTable {
    pub fn new(stride: usize, moves: Vec<u8>) -> Self {
        MoveTable { stride, moves }
    }

    pub fn from_tag_values(values: &[i64]) -> ReadResult<Self> {
        let (&stride, moves) = values
            .split_first()
            .ok_or(ReadError::MalformedTag("mv"))?;
        if stride <= 0 {
            return Err(ReadError::MalformedTag("mv"));
        }

        let moves = moves
            .iter()
            .map(|&m| match m {
                0 => Ok(0),
                1 => Ok(1),
                _ => Err(ReadError::MalformedTag("mv")),
            })
            .collect::<ReadResult<Vec<u8>>>()?;

        Ok(MoveTable::new(stride as usize, moves))
    }

    pub fn num_moves(&self) -> usize {
        self.moves.iter().filter(|&&m| m == 1).count()
    }
}

/// Converts a move table into the query-to-signal map.
///
/// Entry `i` is the first signal sample of base `i`, the last entry is
/// `signal_len`. The move table must contain one move per base call and cover
/// exactly `signal_len / stride` blocks, checked in that order.
pub fn derive_query_to_signal(
    move_table: &MoveTable,
    signal_len: usize,
    seq_len: usize,
) -> ReadResult<Vec<usize>> {
    let num_moves = move_table.num_moves();
    if num_moves != seq_len {
        debug!(
            "Move table (num moves: {}) discordant with basecalls (seq len: {})",
            num_moves, seq_len
        );
        return Err(ReadError::DiscordantMoveTable(Discordance::Basecalls));
    }
    if move_table.moves.len() != signal_len / move_table.stride {
        debug!(
            "Move table (len: {}) discordant with signal (sig len // stride: {})",
            move_table.moves.len(),
            signal_len / move_table.stride
        );
        return Err(ReadError::DiscordantMoveTable(Discordance::Signal));
    }

    let mut query_to_signal = Vec::with_capacity(seq_len + 1);
    query_to_signal.extend(
        move_table
            .moves
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == 1)
            .map(|(i, _)| i * move_table.stride),
    );
    query_to_signal.push(signal_len);

    Ok(query_to_signal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    Match(u32),
    Mismatch(u32),
    Insertion(u32),
    Deletion(u32),
    Skip(u32),
    SoftClip(u32),
    HardClip(u32),
    Padding(u32),
}

impl CigarOp {
    pub fn len(&self) -> usize {
        match self {
            Self::Match(l)
            | Self::Mismatch(l)
            | Self::Insertion(l)
            | Self::Deletion(l)
            | Self::Skip(l)
            | Self::SoftClip(l)
            | Self::HardClip(l)
            | Self::Padding(l) => *l as usize,
        }
    }
}

impl TryFrom<(u32, u8)> for CigarOp {
    type Error = ReadError;

    fn try_from(cigar: (u32, u8)) -> Result<Self, Self::Error> {
        let op = match cigar.1 {
            b'M' | b'=' => CigarOp::Match(cigar.0),
            b'X' => CigarOp::Mismatch(cigar.0),
            b'I' => CigarOp::Insertion(cigar.0),
            b'D' => CigarOp::Deletion(cigar.0),
            b'N' => CigarOp::Skip(cigar.0),
            b'S' => CigarOp::SoftClip(cigar.0),
            b'H' => CigarOp::HardClip(cigar.0),
            b'P' => CigarOp::Padding(cigar.0),
            _ => return Err(ReadError::InvalidCigar("unknown operation")),
        };

        Ok(op)
    }
}

pub fn parse_cigar(cigar: &[u8]) -> ReadResult<Vec<CigarOp>> {
    let n_ops = cigar.iter().filter(|c| !c.is_ascii_digit()).count();
    let mut ops = Vec::with_capacity(n_ops);

    let mut l = 0;
    for &c in cigar {
        if c.is_ascii_digit() {
            l = l * 10 + (c - b'0') as u32;
        } else {
            ops.push(CigarOp::try_from((l, c))?);
            l = 0;
        }
    }

    Ok(ops)
}

/// Projects a query-to-signal map onto the reference through a CIGAR.
///
/// Matches copy the query offsets, insertions and soft clips consume query
/// offsets without emitting anything, deletions and skips repeat the current
/// query offset. The closing entry is the offset right after the last
/// reference-consuming operation, so trailing clips and insertions fall
/// outside.
///
/// The CIGAR must be oriented like `query_seq` and `ref_seq` (reverse-strand
/// callers reverse the operations and reverse-complement the reference first).
pub fn derive_ref_to_signal(
    query_to_signal: &[usize],
    cigar: &[CigarOp],
    query_seq: &[u8],
    ref_seq: &[u8],
) -> ReadResult<Vec<usize>> {
    if query_to_signal.len() != query_seq.len() + 1 {
        return Err(ReadError::DiscordantMoveTable(Discordance::Basecalls));
    }

    let query_len = query_seq.len();
    let ref_len = ref_seq.len();
    let mut ref_to_signal = Vec::with_capacity(ref_len + 1);
    let mut qpos = 0;
    let mut end_qpos = None;

    for op in cigar {
        let l = op.len();
        match op {
            CigarOp::Match(_) | CigarOp::Mismatch(_) => {
                if qpos + l > query_len {
                    return Err(ReadError::InvalidCigar("operations overrun query sequence"));
                }
                if ref_to_signal.len() + l > ref_len {
                    return Err(ReadError::InvalidCigar("operations overrun reference sequence"));
                }

                ref_to_signal.extend_from_slice(&query_to_signal[qpos..qpos + l]);
                qpos += l;
                end_qpos = Some(qpos);
            }
            CigarOp::Insertion(_) | CigarOp::SoftClip(_) => {
                if qpos + l > query_len {
                    return Err(ReadError::InvalidCigar("operations overrun query sequence"));
                }

                qpos += l;
            }
            CigarOp::Deletion(_) | CigarOp::Skip(_) => {
                if ref_to_signal.len() + l > ref_len {
                    return Err(ReadError::InvalidCigar("operations overrun reference sequence"));
                }

                let sig = query_to_signal[qpos];
                ref_to_signal.extend(std::iter::repeat(sig).take(l));
                end_qpos = Some(qpos);
            }
            CigarOp::HardClip(_) | CigarOp::Padding(_) => (),
        }
    }

    if ref_to_signal.len() != ref_len {
        return Err(ReadError::InvalidCigar("operations do not span reference sequence"));
    }
    ref_to_signal.push(query_to_signal[end_qpos.unwrap_or(qpos)]);

    debug_assert_eq!(ref_to_signal.len(), ref_len + 1);
    Ok(ref_to_signal)
}
