use std::fmt;

use bio::alphabets::dna::revcomp;
use log::debug;
use ordered_float::OrderedFloat;

use crate::{
    alignments::AlignmentRecord,
    chunks::CanonicalRead,
    errors::{ReadError, ReadResult},
    mapping::{derive_query_to_signal, derive_ref_to_signal, CigarOp, MoveTable},
    signal::{Calibration, SignalRecord},
};

pub const PA_TO_NORM_SCALING_FACTOR: f32 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "+"),
            Self::Reverse => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPos {
    pub contig: String,
    pub strand: Strand,
    pub start: usize,
}

/// Raw, picoampere and normalized signal spaces.
///
/// Raw to picoampere comes from the signal calibration, picoampere to normalized
/// from the `sm`/`sd` tags or robust statistics. Raw to normalized is their
/// composition and is never stored separately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub calibration: Calibration,
    pub shift_pa_to_norm: f32,
    pub scale_pa_to_norm: f32,
}

impl Normalization {
    pub fn new(calibration: Calibration, shift_pa_to_norm: f32, scale_pa_to_norm: f32) -> Self {
        Normalization {
            calibration,
            shift_pa_to_norm,
            scale_pa_to_norm,
        }
    }

    pub fn from_signal(calibration: Calibration, signal: &[i16]) -> Self {
        let mut pa: Vec<_> = signal
            .iter()
            .map(|&s| OrderedFloat(calibration.to_pa(s)))
            .collect();
        let shift = median(&mut pa);

        let mut deviations: Vec<_> = pa
            .iter()
            .map(|&OrderedFloat(p)| OrderedFloat((p - shift).abs()))
            .collect();
        let scale = (median(&mut deviations) * PA_TO_NORM_SCALING_FACTOR).max(1.);

        Normalization::new(calibration, shift, scale)
    }

    pub fn shift_dacs_to_norm(&self) -> f32 {
        self.shift_pa_to_norm / self.calibration.scale - self.calibration.offset
    }

    pub fn scale_dacs_to_norm(&self) -> f32 {
        self.scale_pa_to_norm / self.calibration.scale
    }

    pub fn pa_to_norm(&self, pa: f32) -> f32 {
        (pa - self.shift_pa_to_norm) / self.scale_pa_to_norm
    }

    pub fn dacs_to_norm(&self, raw: i16) -> f32 {
        (raw as f32 - self.shift_dacs_to_norm()) / self.scale_dacs_to_norm()
    }
}

fn median(values: &mut [OrderedFloat<f32>]) -> f32 {
    if values.is_empty() {
        return 0.;
    }

    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1].0 + values[mid].0) / 2.
    } else {
        values[mid].0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMapping {
    pub seq: Vec<u8>,
    pub cigar: Vec<CigarOp>,
    pub ref_to_signal: Vec<usize>,
}

// Sequences and maps are always in basecall (signal) orientation.
#[derive(Debug, Clone)]
pub struct Read {
    pub(crate) read_id: String,
    pub(crate) signal: Vec<i16>,
    pub(crate) num_trimmed: usize,
    pub(crate) seq: Vec<u8>,
    pub(crate) move_table: MoveTable,
    pub(crate) query_to_signal: Vec<usize>,
    pub(crate) normalization: Normalization,
    pub(crate) ref_pos: Option<RefPos>,
    pub(crate) reference: Option<ReferenceMapping>,
    pub(crate) alignment: AlignmentRecord,
}

impl Read {
    pub fn from_signal_and_alignment(
        signal: &SignalRecord,
        alignment: AlignmentRecord,
    ) -> ReadResult<Self> {
        let num_trimmed = alignment.trim_len()?;
        let trimmed = signal.signal.get(num_trimmed..).unwrap_or(&[]).to_vec();

        let move_table = alignment.move_table()?;
        let stored_seq = alignment.query_sequence();
        let query_to_signal = derive_query_to_signal(&move_table, trimmed.len(), stored_seq.len())?;

        let normalization = match alignment.normalization()? {
            Some((shift, scale)) => Normalization::new(signal.calibration, shift, scale),
            None => {
                debug!("Computing normalization of {}, no tags found", signal.read_id);
                Normalization::from_signal(signal.calibration, &trimmed)
            }
        };

        let is_reverse = alignment.is_reverse();
        let seq = if is_reverse {
            revcomp(&stored_seq)
        } else {
            stored_seq
        };

        let (ref_pos, reference) = match alignment.contig() {
            Some(contig) if alignment.is_mapped() => {
                let ref_pos = RefPos {
                    contig: contig.to_owned(),
                    strand: if is_reverse {
                        Strand::Reverse
                    } else {
                        Strand::Forward
                    },
                    start: alignment.start().unwrap_or(0),
                };

                // basecall anchoring does without the reference
                let reference = match reference_mapping(&alignment, &query_to_signal, &seq) {
                    Ok(reference) => Some(reference),
                    Err(
                        e @ (ReadError::MissingRequiredTag(_)
                        | ReadError::MalformedTag(_)
                        | ReadError::InvalidCigar(_)),
                    ) => {
                        debug!("No reference mapping for {}: {}", signal.read_id, e);
                        None
                    }
                    Err(e) => return Err(e),
                };

                (Some(ref_pos), reference)
            }
            _ => (None, None),
        };

        Ok(Read {
            read_id: signal.read_id.clone(),
            signal: trimmed,
            num_trimmed,
            seq,
            move_table,
            query_to_signal,
            normalization,
            ref_pos,
            reference,
            alignment,
        })
    }

    pub fn read_id(&self) -> &str {
        &self.read_id
    }

    pub fn seq(&self) -> &[u8] {
        &self.seq
    }

    pub fn signal(&self) -> &[i16] {
        &self.signal
    }

    pub fn num_trimmed(&self) -> usize {
        self.num_trimmed
    }

    pub fn move_table(&self) -> &MoveTable {
        &self.move_table
    }

    pub fn query_to_signal(&self) -> &[usize] {
        &self.query_to_signal
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn ref_pos(&self) -> Option<&RefPos> {
        self.ref_pos.as_ref()
    }

    pub fn reference(&self) -> Option<&ReferenceMapping> {
        self.reference.as_ref()
    }

    pub fn alignment(&self) -> &AlignmentRecord {
        &self.alignment
    }

    pub fn into_alignment(self) -> AlignmentRecord {
        self.alignment
    }

    pub fn into_canonical(&self, use_reference_anchor: bool) -> ReadResult<CanonicalRead> {
        let (seq, seq_to_sig) = if use_reference_anchor {
            let reference = self
                .reference
                .as_ref()
                .ok_or(ReadError::IncompleteRead("reference mapping required"))?;
            (&reference.seq, &reference.ref_to_signal)
        } else {
            (&self.seq, &self.query_to_signal)
        };

        let (first, last) = match (seq_to_sig.first(), seq_to_sig.last()) {
            (Some(&first), Some(&last)) if first <= last && last <= self.signal.len() => {
                (first, last)
            }
            _ => return Err(ReadError::IncompleteRead("inconsistent coordinate map")),
        };

        let signal = self.signal[first..last]
            .iter()
            .map(|&s| self.normalization.dacs_to_norm(s))
            .collect();
        let seq_to_sig = seq_to_sig.iter().map(|&s| s - first).collect();

        CanonicalRead::new(self.read_id.clone(), signal, seq_to_sig, seq.clone())
    }
}

fn reference_mapping(
    alignment: &AlignmentRecord,
    query_to_signal: &[usize],
    seq: &[u8],
) -> ReadResult<ReferenceMapping> {
    let mut ref_seq = alignment.reference_sequence()?;
    let mut cigar = alignment.cigar();
    if alignment.is_reverse() {
        cigar.reverse();
        ref_seq = revcomp(&ref_seq);
    }

    let ref_to_signal = derive_ref_to_signal(query_to_signal, &cigar, seq, &ref_seq)?;
    Ok(ReferenceMapping {
        seq: ref_seq,
        cigar,
        ref_to_signal,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;
    use noodles::sam::alignment::{
        record::{
            cigar::{op::Kind, Op},
            data::field::Tag,
            Flags,
        },
        record_buf::{data::field::Value, Cigar, Sequence},
        RecordBuf,
    };

    use super::{Normalization, Read, Strand};
    use crate::{
        alignments::AlignmentRecord,
        errors::{Discordance, ReadError},
        mapping::CigarOp,
        signal::{Calibration, SignalRecord},
    };

    pub(crate) fn unmapped_record(name: &str, seq: &[u8], stride: i8, moves: &[i8]) -> RecordBuf {
        let mut record = RecordBuf::builder()
            .set_name(name)
            .set_sequence(Sequence::from(seq.to_vec()))
            .set_flags(Flags::UNMAPPED)
            .build();

        let mut mv = vec![stride];
        mv.extend_from_slice(moves);
        record.data_mut().insert(Tag::from(*b"mv"), Value::from(mv));

        record
    }

    pub(crate) fn signal_record(read_id: &str, len: usize) -> SignalRecord {
        let signal = (0..len).map(|i| (i % 7) as i16 * 10).collect();
        SignalRecord::new(read_id.to_owned(), signal, Calibration::new(0., 1.))
    }

    #[test]
    fn strand_display() {
        assert_eq!(Strand::Forward.to_string(), "+");
        assert_eq!(Strand::Reverse.to_string(), "-");
    }

    #[test]
    fn normalization_from_signal() {
        let calibration = Calibration::new(10., 0.5);
        // pA: 10, 11, 12, 13, 100
        let signal = [10, 12, 14, 16, 190];
        let norm = Normalization::from_signal(calibration, &signal);

        assert_relative_eq!(norm.shift_pa_to_norm, 12.);
        assert_relative_eq!(norm.scale_pa_to_norm, 1.4826);
        for &s in &signal {
            assert_relative_eq!(
                norm.dacs_to_norm(s),
                norm.pa_to_norm(calibration.to_pa(s)),
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn normalization_scale_at_least_one() {
        let norm = Normalization::from_signal(Calibration::new(0., 1.), &[5, 5, 5, 5]);

        assert_relative_eq!(norm.shift_pa_to_norm, 5.);
        assert_relative_eq!(norm.scale_pa_to_norm, 1.);
        assert_relative_eq!(norm.dacs_to_norm(7), 2.);
    }

    #[test]
    fn assemble_unmapped_read() {
        let mut record = unmapped_record("read_a", b"ACG", 5, &[1, 0, 1, 1]);
        record.data_mut().insert(Tag::from(*b"ts"), Value::from(3u8));
        record.data_mut().insert(Tag::from(*b"sm"), Value::from(20f32));
        record.data_mut().insert(Tag::from(*b"sd"), Value::from(4f32));

        let signal = signal_record("read_a", 23);
        let read =
            Read::from_signal_and_alignment(&signal, AlignmentRecord::new(record, None)).unwrap();

        assert_eq!(read.num_trimmed(), 3);
        assert_eq!(read.signal(), &signal.signal[3..]);
        assert_eq!(read.query_to_signal(), &[0, 10, 15, 20]);
        assert_eq!(read.seq(), b"ACG");
        assert!(read.ref_pos().is_none());
        assert_relative_eq!(read.normalization().dacs_to_norm(24), 1.);

        let canonical = read.into_canonical(false).unwrap();
        assert_eq!(canonical.seq_to_sig, vec![0, 10, 15, 20]);
        assert_eq!(canonical.signal.len(), 20);

        assert_eq!(
            read.into_canonical(true).unwrap_err(),
            ReadError::IncompleteRead("reference mapping required")
        );
    }

    #[test]
    fn assemble_discordant_read() {
        let record = unmapped_record("read_a", b"ACGT", 5, &[1, 0, 1, 1]);
        let signal = signal_record("read_a", 20);

        assert_eq!(
            Read::from_signal_and_alignment(&signal, AlignmentRecord::new(record, None))
                .unwrap_err(),
            ReadError::DiscordantMoveTable(Discordance::Basecalls)
        );
    }

    #[test]
    fn assemble_reverse_mapped_read() {
        // basecalls ACGGT, stored reverse complemented as ACCGT
        let mut record = RecordBuf::builder()
            .set_name("read_r")
            .set_sequence(Sequence::from(b"ACCGT".to_vec()))
            .set_flags(Flags::REVERSE_COMPLEMENTED)
            .set_reference_sequence_id(0)
            .set_alignment_start(noodles::core::Position::try_from(101).unwrap())
            .set_cigar(Cigar::from(vec![
                Op::new(Kind::SoftClip, 1),
                Op::new(Kind::Match, 2),
                Op::new(Kind::Deletion, 1),
                Op::new(Kind::Match, 2),
            ]))
            .build();
        record
            .data_mut()
            .insert(Tag::from(*b"mv"), Value::from(vec![2i8, 1, 1, 0, 1, 1, 1]));
        // reference CCAGT, query [A]CC-GT
        record.data_mut().insert(Tag::from(*b"MD"), Value::from("2^A2"));

        let signal = signal_record("read_r", 12);
        let aln = AlignmentRecord::new(record, Some("chr1".to_owned()));
        let read = Read::from_signal_and_alignment(&signal, aln).unwrap();

        assert_eq!(read.seq(), b"ACGGT");
        assert_eq!(read.query_to_signal(), &[0, 2, 6, 8, 10, 12]);

        let ref_pos = read.ref_pos().unwrap();
        assert_eq!(ref_pos.contig, "chr1");
        assert_eq!(ref_pos.strand, Strand::Reverse);
        assert_eq!(ref_pos.start, 100);

        let reference = read.reference().unwrap();
        assert_eq!(reference.seq, b"ACTGG");
        assert_eq!(
            reference.cigar,
            vec![
                CigarOp::Match(2),
                CigarOp::Deletion(1),
                CigarOp::Match(2),
                CigarOp::SoftClip(1)
            ]
        );
        assert_eq!(reference.ref_to_signal, vec![0, 2, 6, 6, 8, 10]);

        let canonical = read.into_canonical(true).unwrap();
        assert_eq!(canonical.seq, b"ACTGG");
        assert_eq!(canonical.seq_to_sig, vec![0, 2, 6, 6, 8, 10]);
        assert_eq!(canonical.signal.len(), 10);
    }

    #[test]
    fn malformed_md_keeps_read() {
        let mut record = RecordBuf::builder()
            .set_name("read_f")
            .set_sequence(Sequence::from(b"ACGTA".to_vec()))
            .set_flags(Flags::empty())
            .set_reference_sequence_id(0)
            .set_alignment_start(noodles::core::Position::try_from(1).unwrap())
            .set_cigar(Cigar::from(vec![Op::new(Kind::Match, 5)]))
            .build();
        record
            .data_mut()
            .insert(Tag::from(*b"mv"), Value::from(vec![2i8, 1, 1, 1, 1, 1]));
        // MD covers more bases than the CIGAR
        record.data_mut().insert(Tag::from(*b"MD"), Value::from("9"));

        let signal = signal_record("read_f", 10);
        let aln = AlignmentRecord::new(record, Some("chr1".to_owned()));
        let read = Read::from_signal_and_alignment(&signal, aln).unwrap();

        assert_eq!(read.ref_pos().unwrap().strand, Strand::Forward);
        assert!(read.reference().is_none());
        assert_eq!(read.into_canonical(false).unwrap().seq, b"ACGTA");
        assert_eq!(
            read.into_canonical(true).unwrap_err(),
            ReadError::IncompleteRead("reference mapping required")
        );
    }
}
