use std::{fs::File, path::Path, sync::Arc};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use noodles::{
    bam,
    bgzf::{self, VirtualPosition},
    sam::{
        self,
        alignment::{
            io::Write,
            record::{cigar::op::Kind, data::field::Tag},
            record_buf::data::field::{value::Array, Value},
            RecordBuf,
        },
    },
};
use rustc_hash::FxHashMap as HashMap;

use crate::{
    errors::{ErrorFlag, ReadError, ReadResult},
    mapping::{CigarOp, MoveTable},
    read::Read,
    signal::SignalRecord,
};

pub const MOVE_TABLE_TAG: [u8; 2] = *b"mv";
pub const TRIM_TAG: [u8; 2] = *b"ts";
pub const SHIFT_TAG: [u8; 2] = *b"sm";
pub const SCALE_TAG: [u8; 2] = *b"sd";
pub const MISMATCH_TAG: [u8; 2] = *b"MD";

pub const INFERENCE_REQUIRED_TAGS: [[u8; 2]; 1] = [MOVE_TABLE_TAG];

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    record: RecordBuf,
    contig: Option<String>,
}

impl AlignmentRecord {
    pub fn new(record: RecordBuf, contig: Option<String>) -> Self {
        AlignmentRecord { record, contig }
    }

    pub fn record(&self) -> &RecordBuf {
        &self.record
    }

    pub fn into_record(self) -> RecordBuf {
        self.record
    }

    pub fn read_id(&self) -> Option<String> {
        self.record.name().map(|n| n.to_string())
    }

    pub fn query_sequence(&self) -> Vec<u8> {
        self.record.sequence().as_ref().to_vec()
    }

    pub fn is_reverse(&self) -> bool {
        self.record.flags().is_reverse_complemented()
    }

    pub fn is_mapped(&self) -> bool {
        !self.record.flags().is_unmapped() && self.contig.is_some()
    }

    pub fn contig(&self) -> Option<&str> {
        self.contig.as_deref()
    }

    pub fn start(&self) -> Option<usize> {
        self.record
            .alignment_start()
            .map(|pos| usize::from(pos) - 1)
    }

    pub fn move_table(&self) -> ReadResult<MoveTable> {
        let value = self
            .record
            .data()
            .get(&Tag::from(MOVE_TABLE_TAG))
            .ok_or(ReadError::MissingRequiredTag("mv"))?;
        let values = int_array(value).ok_or(ReadError::MalformedTag("mv"))?;

        MoveTable::from_tag_values(&values)
    }

    pub fn trim_len(&self) -> ReadResult<usize> {
        match self.record.data().get(&Tag::from(TRIM_TAG)) {
            None => Ok(0),
            Some(value) => int_value(value)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or(ReadError::MalformedTag("ts")),
        }
    }

    pub fn normalization(&self) -> ReadResult<Option<(f32, f32)>> {
        let data = self.record.data();
        let shift = data.get(&Tag::from(SHIFT_TAG));
        let scale = data.get(&Tag::from(SCALE_TAG));

        match (shift, scale) {
            (Some(shift), Some(scale)) => {
                let shift = float_value(shift).ok_or(ReadError::MalformedTag("sm"))?;
                let scale = float_value(scale).ok_or(ReadError::MalformedTag("sd"))?;
                Ok(Some((shift, scale)))
            }
            _ => Ok(None),
        }
    }

    pub fn cigar(&self) -> Vec<CigarOp> {
        self.record
            .cigar()
            .as_ref()
            .iter()
            .map(|op| cigar_op(op.kind(), op.len()))
            .collect()
    }

    pub fn reference_sequence(&self) -> ReadResult<Vec<u8>> {
        let md = match self.record.data().get(&Tag::from(MISMATCH_TAG)) {
            Some(Value::String(md)) => md,
            Some(_) => return Err(ReadError::MalformedTag("MD")),
            None => return Err(ReadError::MissingRequiredTag("MD")),
        };

        reconstruct_reference(self.record.sequence().as_ref(), &self.cigar(), md.as_ref())
    }
}

fn cigar_op(kind: Kind, len: usize) -> CigarOp {
    let len = len as u32;
    match kind {
        Kind::Match | Kind::SequenceMatch => CigarOp::Match(len),
        Kind::SequenceMismatch => CigarOp::Mismatch(len),
        Kind::Insertion => CigarOp::Insertion(len),
        Kind::Deletion => CigarOp::Deletion(len),
        Kind::Skip => CigarOp::Skip(len),
        Kind::SoftClip => CigarOp::SoftClip(len),
        Kind::HardClip => CigarOp::HardClip(len),
        Kind::Pad => CigarOp::Padding(len),
    }
}

fn int_value(value: &Value) -> Option<i64> {
    match *value {
        Value::Int8(n) => Some(i64::from(n)),
        Value::UInt8(n) => Some(i64::from(n)),
        Value::Int16(n) => Some(i64::from(n)),
        Value::UInt16(n) => Some(i64::from(n)),
        Value::Int32(n) => Some(i64::from(n)),
        Value::UInt32(n) => Some(i64::from(n)),
        _ => None,
    }
}

fn float_value(value: &Value) -> Option<f32> {
    match *value {
        Value::Float(f) => Some(f),
        _ => int_value(value).map(|n| n as f32),
    }
}

fn int_array(value: &Value) -> Option<Vec<i64>> {
    let values = match value {
        Value::Array(Array::Int8(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        Value::Array(Array::UInt8(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        Value::Array(Array::Int16(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        Value::Array(Array::UInt16(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        Value::Array(Array::Int32(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        Value::Array(Array::UInt32(v)) => v.iter().map(|&n| i64::from(n)).collect(),
        _ => return None,
    };

    Some(values)
}

/// Rebuilds the reference span covered by an alignment.
///
/// Skipped regions are not described by `MD` and come out as `N`.
pub fn reconstruct_reference(query: &[u8], cigar: &[CigarOp], md: &[u8]) -> ReadResult<Vec<u8>> {
    let mut reference = Vec::new();
    let mut md_positions = Vec::new();
    let mut qpos = 0;

    for op in cigar {
        let l = op.len();
        match op {
            CigarOp::Match(_) | CigarOp::Mismatch(_) => {
                if qpos + l > query.len() {
                    return Err(ReadError::InvalidCigar("operations overrun query sequence"));
                }

                for &b in &query[qpos..qpos + l] {
                    md_positions.push(reference.len());
                    reference.push(b.to_ascii_uppercase());
                }
                qpos += l;
            }
            CigarOp::Insertion(_) | CigarOp::SoftClip(_) => qpos += l,
            CigarOp::Deletion(_) => {
                for _ in 0..l {
                    md_positions.push(reference.len());
                    reference.push(b'-');
                }
            }
            CigarOp::Skip(_) => reference.extend(std::iter::repeat(b'N').take(l)),
            CigarOp::HardClip(_) | CigarOp::Padding(_) => (),
        }
    }

    let mut idx = 0;
    let mut run = 0;
    let mut in_deletion = false;
    for &c in md {
        if c.is_ascii_digit() {
            run = run * 10 + (c - b'0') as usize;
            in_deletion = false;
            continue;
        }

        idx += run;
        run = 0;
        if c == b'^' {
            in_deletion = true;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(ReadError::MalformedTag("MD"));
        }

        let ref_idx = *md_positions
            .get(idx)
            .ok_or(ReadError::MalformedTag("MD"))?;
        if in_deletion != (reference[ref_idx] == b'-') {
            return Err(ReadError::MalformedTag("MD"));
        }
        reference[ref_idx] = c.to_ascii_uppercase();
        idx += 1;
    }

    if idx + run != md_positions.len() {
        return Err(ReadError::MalformedTag("MD"));
    }

    Ok(reference)
}

fn is_primary(record: &RecordBuf) -> bool {
    let flags = record.flags();
    !flags.is_secondary() && !flags.is_supplementary()
}

fn has_tags(record: &RecordBuf, tags: &[[u8; 2]]) -> bool {
    tags.iter()
        .all(|&tag| record.data().get(&Tag::from(tag)).is_some())
}

fn contig_name(header: &sam::Header, record: &RecordBuf) -> Option<String> {
    record
        .reference_sequence_id()
        .and_then(|id| header.reference_sequences().get_index(id))
        .map(|(name, _)| name.to_string())
}

pub trait AlignmentSource {
    fn records_for(&mut self, read_id: &str) -> ReadResult<Vec<AlignmentRecord>>;
}

pub trait AlignmentSink {
    fn write(&mut self, record: &RecordBuf) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct BamIndex {
    path: std::path::PathBuf,
    header: sam::Header,
    positions: HashMap<String, Vec<VirtualPosition>>,
    num_records: usize,
}

impl BamIndex {
    pub fn build<P: AsRef<Path>>(
        path: P,
        skip_non_primary: bool,
        required_tags: &[[u8; 2]],
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open alignment file {}", path.display()))?;
        let mut reader = bam::io::Reader::new(file);
        let header = reader
            .read_header()
            .with_context(|| format!("Cannot read header of {}", path.display()))?;

        let mut positions: HashMap<String, Vec<VirtualPosition>> = HashMap::default();
        let mut num_records = 0;
        let mut record = RecordBuf::default();
        loop {
            let pos = reader.get_ref().virtual_position();
            let n = reader
                .read_record_buf(&header, &mut record)
                .with_context(|| format!("Cannot read record from {}", path.display()))?;
            if n == 0 {
                break;
            }

            let name = match record.name() {
                Some(name) => name.to_string(),
                None => continue,
            };

            if skip_non_primary && !is_primary(&record) {
                continue;
            }

            let entry = positions.entry(name).or_default();
            if !has_tags(&record, required_tags) || (skip_non_primary && !entry.is_empty()) {
                continue;
            }

            entry.push(pos);
            num_records += 1;
        }

        info!(
            "Indexed {} alignment records of {} reads.",
            num_records,
            positions.len()
        );

        Ok(BamIndex {
            path,
            header,
            positions,
            num_records,
        })
    }

    pub fn header(&self) -> &sam::Header {
        &self.header
    }

    pub fn get(&self, read_id: &str) -> Option<&[VirtualPosition]> {
        self.positions.get(read_id).map(|v| v.as_slice())
    }

    pub fn num_reads(&self) -> usize {
        self.positions.len()
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }
}

pub struct BamAlignmentSource {
    index: Arc<BamIndex>,
    reader: bam::io::Reader<bgzf::Reader<File>>,
}

impl BamAlignmentSource {
    pub fn open(index: Arc<BamIndex>) -> Result<Self> {
        let file = File::open(&index.path)
            .with_context(|| format!("Cannot open alignment file {}", index.path.display()))?;

        Ok(BamAlignmentSource {
            index,
            reader: bam::io::Reader::new(file),
        })
    }

    fn read_at(&mut self, pos: VirtualPosition) -> std::io::Result<AlignmentRecord> {
        self.reader.get_mut().seek(pos)?;

        let header = self.index.header();
        let mut record = RecordBuf::default();
        if self.reader.read_record_buf(header, &mut record)? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        let contig = contig_name(header, &record);
        Ok(AlignmentRecord::new(record, contig))
    }
}

impl AlignmentSource for BamAlignmentSource {
    fn records_for(&mut self, read_id: &str) -> ReadResult<Vec<AlignmentRecord>> {
        let index = Arc::clone(&self.index);
        let positions = index.get(read_id).ok_or(ReadError::ReadNotFound)?;

        positions
            .iter()
            .map(|&pos| {
                self.read_at(pos)
                    .map_err(|e| ReadError::AlignmentIo(e.to_string()))
            })
            .collect()
    }
}

pub struct BamWriter {
    header: sam::Header,
    writer: bam::io::Writer<bgzf::Writer<File>>,
}

impl BamWriter {
    pub fn create<P: AsRef<Path>>(path: P, header: &sam::Header) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Cannot create output file {}", path.display()))?;

        let mut writer = bam::io::Writer::new(file);
        writer
            .write_header(header)
            .with_context(|| format!("Cannot write header to {}", path.display()))?;

        Ok(BamWriter {
            header: header.clone(),
            writer,
        })
    }
}

impl AlignmentSink for BamWriter {
    fn write(&mut self, record: &RecordBuf) -> Result<()> {
        self.writer
            .write_alignment_record(&self.header, record)
            .context("Cannot write alignment record")
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .try_finish()
            .context("Cannot finish output file")
    }
}

pub struct BamRecords {
    reader: bam::io::Reader<bgzf::Reader<File>>,
    header: sam::Header,
    skip_non_primary: bool,
    required_tags: Vec<[u8; 2]>,
}

impl BamRecords {
    pub fn open<P: AsRef<Path>>(
        path: P,
        skip_non_primary: bool,
        required_tags: &[[u8; 2]],
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Cannot open alignment file {}", path.display()))?;
        let mut reader = bam::io::Reader::new(file);
        let header = reader
            .read_header()
            .with_context(|| format!("Cannot read header of {}", path.display()))?;

        Ok(BamRecords {
            reader,
            header,
            skip_non_primary,
            required_tags: required_tags.to_vec(),
        })
    }

    pub fn header(&self) -> &sam::Header {
        &self.header
    }
}

impl Iterator for BamRecords {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut record = RecordBuf::default();
            match self.reader.read_record_buf(&self.header, &mut record) {
                Ok(0) => return None,
                Ok(_) => (),
                Err(e) => {
                    let e = anyhow::Error::new(e).context("Cannot read alignment record");
                    return Some(Err(e));
                }
            }

            if (self.skip_non_primary && !is_primary(&record))
                || !has_tags(&record, &self.required_tags)
            {
                continue;
            }

            let contig = contig_name(&self.header, &record);
            return Some(Ok(AlignmentRecord::new(record, contig)));
        }
    }
}

// Stage 1 when the alignment file drives the run. A read error is fatal.
pub(crate) fn alignment_reader<I>(
    records: I,
    sender: Sender<AlignmentRecord>,
    error_flag: &ErrorFlag,
) -> Result<()>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
{
    for record in records {
        if error_flag.is_set() {
            break;
        }

        let record = error_flag.check(record)?;
        if sender.send(record).is_err() {
            break;
        }
    }

    Ok(())
}

// Stage 2: attaches every indexed alignment to a signal record.
pub(crate) fn alignment_worker<S: AlignmentSource>(
    mut source: S,
    receiver: Receiver<ReadResult<SignalRecord>>,
    sender: Sender<Vec<ReadResult<Read>>>,
    error_flag: &ErrorFlag,
) {
    loop {
        let signal = match receiver.recv() {
            Ok(signal) => signal,
            Err(_) => break,
        };
        if error_flag.is_set() {
            break;
        }

        let group = match signal {
            Ok(signal) => attach_alignments(&mut source, &signal),
            Err(e) => vec![Err(e)],
        };

        if sender.send(group).is_err() {
            break;
        }
    }
}

fn attach_alignments<S: AlignmentSource>(
    source: &mut S,
    signal: &SignalRecord,
) -> Vec<ReadResult<Read>> {
    let records = match source.records_for(&signal.read_id) {
        Ok(records) => records,
        Err(e) => {
            debug!("No alignments for {}: {}", signal.read_id, e);
            return vec![Err(e)];
        }
    };

    records
        .into_iter()
        .map(|record| {
            let read = Read::from_signal_and_alignment(signal, record);
            if let Err(ref e) = read {
                debug!("Cannot assemble read {}: {}", signal.read_id, e);
            }

            read
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, sync::Arc};

    use noodles::{
        core::Position,
        sam::{
            self,
            alignment::{
                record::{
                    cigar::{op::Kind, Op},
                    data::field::Tag,
                    Flags,
                },
                record_buf::{data::field::Value, Cigar, Sequence},
                RecordBuf,
            },
            header::record::value::{map::ReferenceSequence, Map},
        },
    };
    use tempfile::NamedTempFile;

    use crossbeam_channel::unbounded;

    use super::{
        alignment_reader, reconstruct_reference, AlignmentRecord, AlignmentSink, AlignmentSource,
        BamAlignmentSource, BamIndex, BamRecords, BamWriter, INFERENCE_REQUIRED_TAGS,
    };
    use crate::{
        errors::{ErrorFlag, ReadError},
        mapping::{parse_cigar, MoveTable},
    };

    fn header() -> sam::Header {
        let ref_seq = Map::<ReferenceSequence>::new(NonZeroUsize::new(1_000).unwrap());
        sam::Header::builder()
            .add_reference_sequence("chr1", ref_seq)
            .build()
    }

    fn record(name: &str, flags: Flags, with_mv: bool) -> RecordBuf {
        let seq = b"ACGTACGT";
        let mut builder = RecordBuf::builder()
            .set_name(name)
            .set_sequence(Sequence::from(seq.to_vec()))
            .set_flags(flags);
        if !flags.is_unmapped() {
            builder = builder
                .set_reference_sequence_id(0)
                .set_alignment_start(Position::try_from(11).unwrap())
                .set_cigar(Cigar::from(vec![Op::new(Kind::Match, seq.len())]));
        }

        let mut record = builder.build();
        if with_mv {
            record.data_mut().insert(
                Tag::from(*b"mv"),
                Value::from(vec![2i8, 1, 1, 1, 1, 1, 1, 1, 1]),
            );
        }
        record.data_mut().insert(Tag::from(*b"MD"), Value::from("8"));

        record
    }

    #[test]
    fn reconstruct_reference_from_md() {
        // query  AC-GTTA
        // ref    ATCGT-A
        let cigar = parse_cigar(b"2M1D2M1I1M").unwrap();
        let reference = reconstruct_reference(b"ACGTTA", &cigar, b"1T0^C3").unwrap();
        assert_eq!(reference, b"ATCGTA");

        let cigar = parse_cigar(b"2S4M").unwrap();
        let reference = reconstruct_reference(b"ggacgt", &cigar, b"4").unwrap();
        assert_eq!(reference, b"ACGT");
    }

    #[test]
    fn reconstruct_reference_rejects_inconsistent_md() {
        let cigar = parse_cigar(b"4M").unwrap();

        assert_eq!(
            reconstruct_reference(b"ACGT", &cigar, b"5"),
            Err(ReadError::MalformedTag("MD"))
        );
        assert_eq!(
            reconstruct_reference(b"ACGT", &cigar, b"1^A3"),
            Err(ReadError::MalformedTag("MD"))
        );
    }

    #[test]
    fn record_accessors() {
        let mut rec = record("read_a", Flags::REVERSE_COMPLEMENTED, true);
        rec.data_mut().insert(Tag::from(*b"ts"), Value::from(10u8));
        rec.data_mut().insert(Tag::from(*b"sm"), Value::from(90.5f32));
        rec.data_mut().insert(Tag::from(*b"sd"), Value::from(12.25f32));

        let aln = AlignmentRecord::new(rec, Some("chr1".to_owned()));
        assert_eq!(aln.read_id().as_deref(), Some("read_a"));
        assert!(aln.is_reverse());
        assert!(aln.is_mapped());
        assert_eq!(aln.start(), Some(10));
        assert_eq!(aln.trim_len(), Ok(10));
        assert_eq!(aln.normalization(), Ok(Some((90.5, 12.25))));
        assert_eq!(aln.move_table(), Ok(MoveTable::new(2, vec![1; 8])));
        assert_eq!(aln.reference_sequence().unwrap(), b"ACGTACGT");
    }

    #[test]
    fn missing_tags() {
        let mut rec = record("read_a", Flags::UNMAPPED, false);
        rec.data_mut().remove(&Tag::from(*b"MD"));
        rec.data_mut().insert(Tag::from(*b"sm"), Value::from(90.5f32));

        let aln = AlignmentRecord::new(rec, None);
        assert!(!aln.is_mapped());
        assert_eq!(aln.trim_len(), Ok(0));
        assert_eq!(aln.normalization(), Ok(None));
        assert_eq!(aln.move_table(), Err(ReadError::MissingRequiredTag("mv")));
        assert_eq!(
            aln.reference_sequence(),
            Err(ReadError::MissingRequiredTag("MD"))
        );
    }

    fn write_bam(records: &[RecordBuf]) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let mut writer = BamWriter::create(file.path(), &header()).unwrap();
        for record in records {
            writer.write(record).unwrap();
        }
        writer.finish().unwrap();

        file
    }

    #[test]
    fn index_and_fetch_records() {
        let file = write_bam(&[
            record("read_a", Flags::empty(), true),
            record("read_b", Flags::UNMAPPED, true),
            record("read_a", Flags::SECONDARY, true),
            record("read_c", Flags::UNMAPPED, false),
        ]);

        let index = BamIndex::build(file.path(), false, &INFERENCE_REQUIRED_TAGS).unwrap();
        let index = Arc::new(index);
        assert_eq!(index.num_records(), 3);
        assert_eq!(index.num_reads(), 3);
        assert_eq!(index.get("read_c").map(|p| p.len()), Some(0));

        let mut source = BamAlignmentSource::open(Arc::clone(&index)).unwrap();
        let a = source.records_for("read_a").unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].contig(), Some("chr1"));
        assert!(a[1].record().flags().is_secondary());

        let b = source.records_for("read_b").unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].contig(), None);

        assert!(source.records_for("read_c").unwrap().is_empty());
        assert_eq!(
            source.records_for("read_x").unwrap_err(),
            ReadError::ReadNotFound
        );
    }

    #[test]
    fn index_primary_only() {
        let file = write_bam(&[
            record("read_a", Flags::SECONDARY, true),
            record("read_a", Flags::empty(), true),
            record("read_a", Flags::SUPPLEMENTARY, true),
            record("read_a", Flags::empty(), true),
        ]);

        let index = BamIndex::build(file.path(), true, &INFERENCE_REQUIRED_TAGS).unwrap();
        assert_eq!(index.num_records(), 1);

        let mut source = BamAlignmentSource::open(Arc::new(index)).unwrap();
        let a = source.records_for("read_a").unwrap();
        assert_eq!(a.len(), 1);
        assert!(!a[0].record().flags().is_secondary());
    }

    #[test]
    fn stream_records_in_file_order() {
        let file = write_bam(&[
            record("read_b", Flags::UNMAPPED, true),
            record("read_a", Flags::SECONDARY, true),
            record("read_c", Flags::UNMAPPED, false),
            record("read_a", Flags::empty(), true),
        ]);

        let records = BamRecords::open(file.path(), true, &INFERENCE_REQUIRED_TAGS).unwrap();
        let records: Vec<_> = records.map(|r| r.unwrap()).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].read_id().as_deref(), Some("read_b"));
        assert_eq!(records[0].contig(), None);
        assert_eq!(records[1].read_id().as_deref(), Some("read_a"));
        assert_eq!(records[1].contig(), Some("chr1"));
    }

    #[test]
    fn alignment_reader_stops_at_read_error() {
        let records = vec![
            Ok(AlignmentRecord::new(record("read_a", Flags::UNMAPPED, true), None)),
            Err(anyhow::anyhow!("truncated file")),
            Ok(AlignmentRecord::new(record("read_b", Flags::UNMAPPED, true), None)),
        ];
        let (sender, receiver) = unbounded();
        let flag = ErrorFlag::default();

        assert!(alignment_reader(records, sender, &flag).is_err());
        assert!(flag.is_set());

        let names: Vec<_> = receiver.iter().filter_map(|r| r.read_id()).collect();
        assert_eq!(names, vec!["read_a"]);
    }
}
