use std::{
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use rustc_hash::FxHashMap as HashMap;

use crate::{
    alignments::AlignmentRecord,
    errors::{ErrorFlag, ReadError, ReadResult},
    read::Read,
};

// Linear sample to picoampere transform, `pA = scale * (raw + offset)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub offset: f32,
    pub scale: f32,
}

impl Calibration {
    pub fn new(offset: f32, scale: f32) -> Self {
        Calibration { offset, scale }
    }

    pub fn to_pa(&self, raw: i16) -> f32 {
        self.scale * (raw as f32 + self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub read_id: String,
    pub signal: Vec<i16>,
    pub calibration: Calibration,
}

impl SignalRecord {
    pub fn new(read_id: String, signal: Vec<i16>, calibration: Calibration) -> Self {
        SignalRecord {
            read_id,
            signal,
            calibration,
        }
    }
}

pub trait SignalSource {
    fn read_ids(&self) -> Vec<String>;

    fn read(&mut self, read_id: &str) -> ReadResult<SignalRecord>;
}

#[derive(Debug, Clone, Copy)]
struct Slow5Columns {
    read_id: usize,
    digitisation: usize,
    offset: usize,
    range: usize,
    len_raw_signal: usize,
    raw_signal: usize,
}

impl Slow5Columns {
    fn from_header(line: &str) -> Result<Self> {
        let names: Vec<_> = line.trim_start_matches('#').split('\t').collect();
        let find = |name: &str| {
            names
                .iter()
                .position(|&n| n == name)
                .ok_or_else(|| anyhow!("SLOW5 header is missing column {}", name))
        };

        Ok(Slow5Columns {
            read_id: find("read_id")?,
            digitisation: find("digitisation")?,
            offset: find("offset")?,
            range: find("range")?,
            len_raw_signal: find("len_raw_signal")?,
            raw_signal: find("raw_signal")?,
        })
    }
}

pub struct Slow5Index {
    path: PathBuf,
    columns: Slow5Columns,
    read_ids: Vec<String>,
    offsets: HashMap<String, u64>,
}

impl Slow5Index {
    pub fn build<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)
            .with_context(|| format!("Cannot open signal file {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut columns = None;
        let mut read_ids = Vec::new();
        let mut offsets = HashMap::default();

        let mut line = String::new();
        let mut pos = 0u64;
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .with_context(|| format!("Cannot read signal file {}", path.display()))?;
            if n == 0 {
                break;
            }

            let record = line.trim_end();
            if record.starts_with("#read_id") {
                columns = Some(Slow5Columns::from_header(record)?);
            } else if !record.is_empty() && !record.starts_with(['#', '@']) {
                let cols = columns.context("SLOW5 record found before column header")?;
                let id = record
                    .split('\t')
                    .nth(cols.read_id)
                    .context("SLOW5 record without read id")?
                    .to_owned();

                if offsets.insert(id.clone(), pos).is_some() {
                    bail!("Duplicate read id {} in signal file", id);
                }
                read_ids.push(id);
            }

            pos += n as u64;
        }

        let columns = columns.context("SLOW5 column header not found")?;
        info!("Indexed {} signal records.", read_ids.len());

        Ok(Slow5Index {
            path,
            columns,
            read_ids,
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.read_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_ids.is_empty()
    }
}

pub struct Slow5Reader {
    index: Arc<Slow5Index>,
    reader: BufReader<File>,
    buffer: String,
}

impl Slow5Reader {
    pub fn open(index: Arc<Slow5Index>) -> Result<Self> {
        let file = File::open(&index.path)
            .with_context(|| format!("Cannot open signal file {}", index.path.display()))?;

        Ok(Slow5Reader {
            index,
            reader: BufReader::new(file),
            buffer: String::new(),
        })
    }

    fn parse_record(&self, read_id: &str) -> ReadResult<SignalRecord> {
        let cols = &self.index.columns;
        let fields: Vec<_> = self.buffer.trim_end().split('\t').collect();
        let field = |i: usize| {
            fields
                .get(i)
                .copied()
                .ok_or(ReadError::MalformedSignal("missing column"))
        };
        let number = |i: usize, name: &'static str| {
            field(i)?
                .parse::<f32>()
                .map_err(|_| ReadError::MalformedSignal(name))
        };

        if field(cols.read_id)? != read_id {
            return Err(ReadError::MalformedSignal("read id mismatch"));
        }

        let digitisation = number(cols.digitisation, "digitisation")?;
        let offset = number(cols.offset, "offset")?;
        let range = number(cols.range, "range")?;
        if digitisation == 0. {
            return Err(ReadError::MalformedSignal("digitisation"));
        }

        let expected_len = field(cols.len_raw_signal)?
            .parse::<usize>()
            .map_err(|_| ReadError::MalformedSignal("len_raw_signal"))?;
        let signal = field(cols.raw_signal)?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i16>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ReadError::MalformedSignal("raw_signal"))?;
        if signal.len() != expected_len {
            debug!(
                "Read {} declares {} samples, found {}",
                read_id,
                expected_len,
                signal.len()
            );
            return Err(ReadError::MalformedSignal("len_raw_signal"));
        }

        Ok(SignalRecord::new(
            read_id.to_owned(),
            signal,
            Calibration::new(offset, range / digitisation),
        ))
    }
}

impl SignalSource for Slow5Reader {
    fn read_ids(&self) -> Vec<String> {
        self.index.read_ids.clone()
    }

    fn read(&mut self, read_id: &str) -> ReadResult<SignalRecord> {
        let pos = *self
            .index
            .offsets
            .get(read_id)
            .ok_or(ReadError::SignalNotFound)?;

        self.buffer.clear();
        self.reader
            .seek(SeekFrom::Start(pos))
            .and_then(|_| self.reader.read_line(&mut self.buffer))
            .map_err(|e| ReadError::SignalIo(e.to_string()))?;

        self.parse_record(read_id)
    }
}

// Stage 1: reads every signal record sequentially, in storage order.
pub(crate) fn signal_reader<S: SignalSource>(
    mut source: S,
    read_ids: impl IntoIterator<Item = String>,
    sender: Sender<ReadResult<SignalRecord>>,
    error_flag: &ErrorFlag,
) {
    for read_id in read_ids {
        if error_flag.is_set() {
            break;
        }

        let record = source.read(&read_id);
        if let Err(ref e) = record {
            debug!("Cannot read signal of {}: {}", read_id, e);
        }

        if sender.send(record).is_err() {
            // Downstream stages are gone, nothing left to feed.
            break;
        }
    }
}

// Stage 2 when the alignment file drives the run.
pub(crate) fn signal_worker<S: SignalSource>(
    mut source: S,
    receiver: Receiver<AlignmentRecord>,
    sender: Sender<Vec<ReadResult<Read>>>,
    error_flag: &ErrorFlag,
) {
    loop {
        let alignment = match receiver.recv() {
            Ok(alignment) => alignment,
            Err(_) => break,
        };
        if error_flag.is_set() {
            break;
        }

        let read = attach_signal(&mut source, alignment);
        if sender.send(vec![read]).is_err() {
            break;
        }
    }
}

fn attach_signal<S: SignalSource>(source: &mut S, alignment: AlignmentRecord) -> ReadResult<Read> {
    let read_id = alignment
        .read_id()
        .ok_or(ReadError::IncompleteRead("alignment without read name"))?;
    let signal = source.read(&read_id).map_err(|e| {
        debug!("Cannot read signal of {}: {}", read_id, e);
        e
    })?;

    let read = Read::from_signal_and_alignment(&signal, alignment);
    if let Err(ref e) = read {
        debug!("Cannot assemble read {}: {}", read_id, e);
    }

    read
}
