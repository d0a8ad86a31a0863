use std::{path::Path, sync::Arc, thread};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::info;
use noodles::sam::alignment::RecordBuf;

use pbars::{get_index_spinner, set_index_spinner_finish, track_progress, PBarNotification};

use crate::{
    alignments::{
        alignment_reader, alignment_worker, AlignmentRecord, AlignmentSink, AlignmentSource,
        BamAlignmentSource, BamIndex, BamRecords, BamWriter, INFERENCE_REQUIRED_TAGS,
    },
    duplex::{pair_signal_reader, parse_pairs},
    errors::{ErrorCounts, ErrorFlag, ReadError, ReadResult},
    inference::{duplex_worker, mods_worker, ModCaller, ModInference, ModelMetadata},
    read::Read,
    signal::{signal_reader, signal_worker, SignalSource, Slow5Index, Slow5Reader},
};

pub mod alignments;
pub mod chunks;
pub mod dataset;
pub mod duplex;
pub mod errors;
pub mod inference;
pub mod mapping;
mod pbars;
pub mod read;
pub mod signal;
pub mod tags;

pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
pub(crate) const DEFAULT_BATCH_SIZE: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    // Stage-2 workers. They look up alignments, or signals when the alignment
    // file drives the run.
    pub alignment_workers: usize,
    pub mod_workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub skip_non_primary: bool,
    pub focus_offset: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            alignment_workers: 1,
            mod_workers: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            skip_non_primary: true,
            focus_offset: None,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.alignment_workers == 0 || self.mod_workers == 0 {
            bail!("Every stage needs at least one worker");
        }
        if self.queue_capacity == 0 {
            bail!("Queue capacity must be positive");
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub emitted: usize,
    pub failures: ErrorCounts,
}

pub fn infer_from_signal_and_alignments<P, Q, R, M, F>(
    signal_path: P,
    alignments_path: Q,
    output_path: R,
    metadata: ModelMetadata,
    prepare_model: F,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
    M: ModInference,
    F: Fn() -> Result<M> + Sync,
{
    let signal_index = Arc::new(Slow5Index::build(signal_path)?);
    let signals = Slow5Reader::open(Arc::clone(&signal_index))?;

    let bam_index = Arc::new(index_alignments(
        alignments_path,
        config.skip_non_primary,
        &INFERENCE_REQUIRED_TAGS,
    )?);
    let mut writer = BamWriter::create(output_path, bam_index.header())?;

    call_mods(
        signals,
        || BamAlignmentSource::open(Arc::clone(&bam_index)),
        prepare_model,
        &mut writer,
        metadata,
        config,
    )
}

/// Same as [`infer_from_signal_and_alignments`], but walks the alignment file
/// in its own order and fetches the signal of every record.
pub fn infer_from_alignments_and_signal<P, Q, R, M, F>(
    alignments_path: P,
    signal_path: Q,
    output_path: R,
    metadata: ModelMetadata,
    prepare_model: F,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
    M: ModInference,
    F: Fn() -> Result<M> + Sync,
{
    let signal_index = Arc::new(Slow5Index::build(signal_path)?);
    let records = BamRecords::open(
        alignments_path,
        config.skip_non_primary,
        &INFERENCE_REQUIRED_TAGS,
    )?;
    let mut writer = BamWriter::create(output_path, records.header())?;

    call_mods_from_alignments(
        records,
        || Slow5Reader::open(Arc::clone(&signal_index)),
        prepare_model,
        &mut writer,
        metadata,
        config,
    )
}

pub fn infer_duplex<P, Q, R, S, T, M, F>(
    pairs_path: P,
    signal_path: Q,
    simplex_path: R,
    duplex_path: S,
    output_path: T,
    metadata: ModelMetadata,
    prepare_model: F,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
    S: AsRef<Path>,
    T: AsRef<Path>,
    M: ModInference,
    F: Fn() -> Result<M> + Sync,
{
    let pairs = parse_pairs(pairs_path)?;
    info!("Parsed {} read pairs.", pairs.len());

    let signal_index = Arc::new(Slow5Index::build(signal_path)?);
    let signals = Slow5Reader::open(Arc::clone(&signal_index))?;

    let simplex_index = Arc::new(index_alignments(
        simplex_path,
        config.skip_non_primary,
        &INFERENCE_REQUIRED_TAGS,
    )?);
    let duplex_index = Arc::new(index_alignments(duplex_path, config.skip_non_primary, &[])?);
    let mut writer = BamWriter::create(output_path, duplex_index.header())?;

    call_duplex_mods(
        signals,
        pairs,
        || BamAlignmentSource::open(Arc::clone(&simplex_index)),
        || BamAlignmentSource::open(Arc::clone(&duplex_index)),
        prepare_model,
        &mut writer,
        metadata,
        config,
    )
}

fn index_alignments<P: AsRef<Path>>(
    path: P,
    skip_non_primary: bool,
    required_tags: &[[u8; 2]],
) -> Result<BamIndex> {
    let spinner = get_index_spinner(None, "Indexing alignments");
    let index = BamIndex::build(path, skip_non_primary, required_tags)?;
    set_index_spinner_finish(index.num_reads(), "reads", spinner);

    Ok(index)
}

fn join_worker(handle: Worker<'_>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("Pipeline worker panicked"))?
}

/// Four stage pipeline over any signal and alignment sources.
///
/// Every stage-2 worker opens its own alignment source and every stage-3
/// worker prepares its own model. Per-read failures are tallied. A failing
/// `open_alignments` or `prepare_model` raises the error flag, which winds
/// down every stage and fails the run.
pub fn call_mods<SS, AS, FA, M, FM, K>(
    signals: SS,
    open_alignments: FA,
    prepare_model: FM,
    sink: &mut K,
    metadata: ModelMetadata,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    SS: SignalSource + Send,
    AS: AlignmentSource,
    FA: Fn() -> Result<AS> + Sync,
    M: ModInference,
    FM: Fn() -> Result<M> + Sync,
    K: AlignmentSink + Send,
{
    config.validate()?;
    let caller = ModCaller::new(metadata, config.batch_size, config.focus_offset)?;

    let read_ids = signals.read_ids();
    info!(
        "Calling mods on {} reads with {} alignment and {} mod workers.",
        read_ids.len(),
        config.alignment_workers,
        config.mod_workers
    );

    let (signal_sender, signal_receiver) = bounded(config.queue_capacity);
    let (reads_sender, reads_receiver) = bounded(config.queue_capacity);
    let (records_sender, records_receiver) = bounded(config.queue_capacity);
    let (pbar_sender, pbar_receiver) = unbounded();
    let _ = pbar_sender.send(PBarNotification::Total(read_ids.len() as u64));

    let error_flag = ErrorFlag::default();
    let (summary, workers) = thread::scope(|s| {
        let flag = &error_flag;
        s.spawn(move || signal_reader(signals, read_ids, signal_sender, flag));

        let mut workers = Vec::with_capacity(config.alignment_workers + config.mod_workers);
        for _ in 0..config.alignment_workers {
            let signal_r = signal_receiver.clone();
            let reads_s = reads_sender.clone();
            let open = &open_alignments;

            workers.push(s.spawn(move || -> Result<()> {
                let source = flag.check(open()).context("Cannot open alignment source")?;
                alignment_worker(source, signal_r, reads_s, flag);
                Ok(())
            }));
        }
        drop(signal_receiver);
        drop(reads_sender);

        spawn_mod_workers(
            s,
            &mut workers,
            &caller,
            &prepare_model,
            reads_receiver,
            records_sender,
            flag,
            config,
        );
        let writer =
            s.spawn(move || flag.check(write_records(sink, records_receiver, pbar_sender)));
        track_progress(pbar_receiver);

        join_all(writer, workers)
    });

    finish_run(summary, workers)
}

/// Variant of [`call_mods`] driven by alignment records instead of signals.
///
/// Stage 1 streams the records, every stage-2 worker opens its own signal
/// source. A record that cannot be read is fatal.
pub fn call_mods_from_alignments<I, SS, FS, M, FM, K>(
    records: I,
    open_signals: FS,
    prepare_model: FM,
    sink: &mut K,
    metadata: ModelMetadata,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
    I::IntoIter: Send,
    SS: SignalSource,
    FS: Fn() -> Result<SS> + Sync,
    M: ModInference,
    FM: Fn() -> Result<M> + Sync,
    K: AlignmentSink + Send,
{
    config.validate()?;
    let caller = ModCaller::new(metadata, config.batch_size, config.focus_offset)?;
    info!(
        "Calling mods in alignment order with {} signal and {} mod workers.",
        config.alignment_workers, config.mod_workers
    );

    let (alignments_sender, alignments_receiver) = bounded(config.queue_capacity);
    let (reads_sender, reads_receiver) = bounded(config.queue_capacity);
    let (records_sender, records_receiver) = bounded(config.queue_capacity);
    let (pbar_sender, pbar_receiver) = unbounded();

    // total is unknown up front, every streamed record extends the bar
    let queued_sender = pbar_sender.clone();
    let records = records.into_iter().inspect(move |_| {
        let _ = queued_sender.send(PBarNotification::Queued);
    });

    let error_flag = ErrorFlag::default();
    let (summary, workers) = thread::scope(|s| {
        let flag = &error_flag;

        let mut workers = Vec::with_capacity(1 + config.alignment_workers + config.mod_workers);
        workers.push(s.spawn(move || alignment_reader(records, alignments_sender, flag)));

        for _ in 0..config.alignment_workers {
            let alignments_r = alignments_receiver.clone();
            let reads_s = reads_sender.clone();
            let open = &open_signals;

            workers.push(s.spawn(move || -> Result<()> {
                let source = flag.check(open()).context("Cannot open signal source")?;
                signal_worker(source, alignments_r, reads_s, flag);
                Ok(())
            }));
        }
        drop(alignments_receiver);
        drop(reads_sender);

        spawn_mod_workers(
            s,
            &mut workers,
            &caller,
            &prepare_model,
            reads_receiver,
            records_sender,
            flag,
            config,
        );
        let writer =
            s.spawn(move || flag.check(write_records(sink, records_receiver, pbar_sender)));
        track_progress(pbar_receiver);

        join_all(writer, workers)
    });

    finish_run(summary, workers)
}

type Worker<'scope> = thread::ScopedJoinHandle<'scope, Result<()>>;

// Stage 3 of the simplex pipelines. The caller's receiver and sender are
// consumed so the channels close once every worker is done.
#[allow(clippy::too_many_arguments)]
fn spawn_mod_workers<'scope, 'env, M, FM>(
    s: &'scope thread::Scope<'scope, 'env>,
    workers: &mut Vec<Worker<'scope>>,
    caller: &'scope ModCaller,
    prepare_model: &'scope FM,
    reads_receiver: Receiver<Vec<ReadResult<Read>>>,
    records_sender: Sender<Vec<ReadResult<RecordBuf>>>,
    flag: &'scope ErrorFlag,
    config: &PipelineConfig,
) where
    M: ModInference,
    FM: Fn() -> Result<M> + Sync,
{
    for _ in 0..config.mod_workers {
        let reads_r = reads_receiver.clone();
        let records_s = records_sender.clone();

        workers.push(s.spawn(move || -> Result<()> {
            let model = flag.check(prepare_model()).context("Cannot prepare model")?;
            mods_worker(caller, &model, reads_r, records_s, flag);
            Ok(())
        }));
    }
}

fn join_all(
    writer: thread::ScopedJoinHandle<'_, Result<PipelineSummary>>,
    workers: Vec<Worker<'_>>,
) -> (Result<Result<PipelineSummary>>, Vec<Result<()>>) {
    let summary = writer
        .join()
        .map_err(|_| anyhow!("Output writer panicked"));
    let workers = workers.into_iter().map(join_worker).collect();

    (summary, workers)
}

pub fn call_duplex_mods<SS, AS, FA, AD, FD, M, FM, K>(
    signals: SS,
    pairs: Vec<(String, String)>,
    open_simplex: FA,
    open_duplex: FD,
    prepare_model: FM,
    sink: &mut K,
    metadata: ModelMetadata,
    config: &PipelineConfig,
) -> Result<PipelineSummary>
where
    SS: SignalSource + Send,
    AS: AlignmentSource,
    FA: Fn() -> Result<AS> + Sync,
    AD: AlignmentSource,
    FD: Fn() -> Result<AD> + Sync,
    M: ModInference,
    FM: Fn() -> Result<M> + Sync,
    K: AlignmentSink + Send,
{
    config.validate()?;
    let caller = ModCaller::new(metadata, config.batch_size, config.focus_offset)?;

    let (pairs_sender, pairs_receiver) = bounded(config.queue_capacity);
    let (records_sender, records_receiver) = bounded(config.queue_capacity);
    let (pbar_sender, pbar_receiver) = unbounded();
    let _ = pbar_sender.send(PBarNotification::Total(pairs.len() as u64));

    let error_flag = ErrorFlag::default();
    let (summary, workers) = thread::scope(|s| {
        let flag = &error_flag;
        s.spawn(move || pair_signal_reader(signals, pairs, pairs_sender, flag));

        let mut workers = Vec::with_capacity(config.mod_workers);
        for _ in 0..config.mod_workers {
            let pairs_r = pairs_receiver.clone();
            let records_s = records_sender.clone();
            let (open_s, open_d) = (&open_simplex, &open_duplex);
            let (prepare, caller) = (&prepare_model, &caller);

            workers.push(s.spawn(move || -> Result<()> {
                let simplex =
                    flag.check(open_s()).context("Cannot open simplex alignment source")?;
                let duplex = flag.check(open_d()).context("Cannot open duplex alignment source")?;
                let model = flag.check(prepare()).context("Cannot prepare model")?;
                duplex_worker(caller, &model, simplex, duplex, pairs_r, records_s, flag);
                Ok(())
            }));
        }
        drop(pairs_receiver);
        drop(records_sender);

        let writer =
            s.spawn(move || flag.check(write_records(sink, records_receiver, pbar_sender)));
        track_progress(pbar_receiver);

        join_all(writer, workers)
    });

    finish_run(summary, workers)
}

fn finish_run(
    summary: Result<Result<PipelineSummary>>,
    workers: Vec<Result<()>>,
) -> Result<PipelineSummary> {
    // worker failures take precedence over the writer's
    for worker in workers {
        worker?;
    }
    let summary = summary??;

    info!("Wrote {} records.", summary.emitted);
    summary.failures.log_summary();
    if summary.emitted == 0 && !summary.failures.is_empty() {
        bail!(
            "No reads were successfully processed ({} failures)",
            summary.failures.total()
        );
    }

    Ok(summary)
}

// Stage 4: writes tagged records and tallies failures.
fn write_records<K: AlignmentSink>(
    sink: &mut K,
    receiver: Receiver<Vec<ReadResult<RecordBuf>>>,
    pbar_sender: Sender<PBarNotification>,
) -> Result<PipelineSummary> {
    let mut summary = PipelineSummary::default();

    loop {
        let group = match receiver.recv() {
            Ok(group) => group,
            Err(_) => break,
        };

        if group.is_empty() {
            summary.failures.record(&ReadError::NoValidMappings);
        }
        for record in group {
            match record {
                Ok(record) => {
                    sink.write(&record)?;
                    summary.emitted += 1;
                }
                Err(e) => summary.failures.record(&e),
            }
        }

        let _ = pbar_sender.send(PBarNotification::Inc);
    }

    sink.finish()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use anyhow::{anyhow, bail, Result};
    use bio::alphabets::dna::revcomp;
    use ndarray::Array2;
    use noodles::sam::alignment::{record::Flags, record_buf::Sequence, RecordBuf};
    use rustc_hash::FxHashMap as HashMap;

    use super::{call_duplex_mods, call_mods, call_mods_from_alignments, PipelineConfig};
    use crate::{
        alignments::{AlignmentRecord, AlignmentSink, AlignmentSource},
        errors::{Discordance, ReadError, ReadResult},
        inference::{
            tests::{metadata, FailingModel, MeanModel},
            ModInference, ModelInput,
        },
        read::tests::{signal_record, unmapped_record},
        signal::{SignalRecord, SignalSource},
        tags::{mod_tags_from_record, parse_mm_ml_tags},
    };

    const SEQ: &[u8] = b"ACGCGTTCGA";

    #[derive(Clone)]
    struct FakeSignals {
        records: Vec<SignalRecord>,
    }

    impl SignalSource for FakeSignals {
        fn read_ids(&self) -> Vec<String> {
            self.records.iter().map(|r| r.read_id.clone()).collect()
        }

        fn read(&mut self, read_id: &str) -> ReadResult<SignalRecord> {
            self.records
                .iter()
                .find(|r| r.read_id == read_id)
                .cloned()
                .ok_or(ReadError::SignalNotFound)
        }
    }

    #[derive(Clone, Default)]
    struct FakeAlignments {
        records: HashMap<String, Vec<AlignmentRecord>>,
    }

    impl AlignmentSource for FakeAlignments {
        fn records_for(&mut self, read_id: &str) -> ReadResult<Vec<AlignmentRecord>> {
            self.records
                .get(read_id)
                .cloned()
                .ok_or(ReadError::ReadNotFound)
        }
    }

    #[derive(Default)]
    struct VecSink {
        records: Vec<RecordBuf>,
        finished: bool,
    }

    impl AlignmentSink for VecSink {
        fn write(&mut self, record: &RecordBuf) -> Result<()> {
            self.records.push(record.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    struct SlowModel;

    impl ModInference for SlowModel {
        fn infer(&self, input: &ModelInput) -> Result<Array2<f32>> {
            thread::sleep(Duration::from_millis(20));
            MeanModel.infer(input)
        }
    }

    fn moves() -> Vec<i8> {
        // stride 2, one base every 4 samples
        (0..20).map(|i| if i % 2 == 0 { 1 } else { 0 }).collect()
    }

    fn alignment(name: &str, seq: &[u8]) -> AlignmentRecord {
        AlignmentRecord::new(unmapped_record(name, seq, 2, &moves()), None)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            alignment_workers: 2,
            mod_workers: 2,
            queue_capacity: 2,
            batch_size: 2,
            skip_non_primary: false,
            focus_offset: None,
        }
    }

    fn inputs() -> (FakeSignals, FakeAlignments) {
        let signals = FakeSignals {
            records: vec![
                signal_record("r1", 40),
                signal_record("r2", 40),
                signal_record("r3", 40),
                signal_record("r4", 40),
                signal_record("r5", 30),
            ],
        };

        let mut alignments = FakeAlignments::default();
        alignments
            .records
            .insert("r1".to_owned(), vec![alignment("r1", SEQ)]);
        alignments.records.insert(
            "r2".to_owned(),
            vec![alignment("r2", SEQ), alignment("r2", SEQ)],
        );
        alignments.records.insert("r4".to_owned(), Vec::new());
        alignments
            .records
            .insert("r5".to_owned(), vec![alignment("r5", SEQ)]);

        (signals, alignments)
    }

    #[test]
    fn pipeline_end_to_end() {
        let (signals, alignments) = inputs();
        let mut sink = VecSink::default();

        let summary = call_mods(
            signals,
            || Ok(alignments.clone()),
            || Ok(MeanModel),
            &mut sink,
            metadata(),
            &config(),
        )
        .unwrap();

        assert!(sink.finished);
        assert_eq!(summary.emitted, 3);
        assert_eq!(sink.records.len(), 3);

        let mut names: Vec<_> = sink
            .records
            .iter()
            .map(|r| r.name().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["r1", "r2", "r2"]);

        for record in sink.records.iter() {
            let tags = mod_tags_from_record(record).unwrap().unwrap();
            assert_eq!(tags.mm, "C+m?,0,0,0;");
            let calls = parse_mm_ml_tags(SEQ, &tags).unwrap();
            assert_eq!(calls[0].positions, vec![1, 3, 7]);
        }

        let failures = &summary.failures;
        assert_eq!(failures.total(), 3);
        assert_eq!(failures.get(&ReadError::ReadNotFound.to_string()), 1);
        assert_eq!(failures.get(&ReadError::NoValidMappings.to_string()), 1);
        assert_eq!(
            failures.get(&ReadError::DiscordantMoveTable(Discordance::Signal).to_string()),
            1
        );
    }

    #[test]
    fn inference_failures_are_tallied() {
        let (signals, alignments) = inputs();
        let mut sink = VecSink::default();

        let res = call_mods(
            signals,
            || Ok(alignments.clone()),
            || Ok(FailingModel),
            &mut sink,
            metadata(),
            &config(),
        );

        // nothing emitted, so the run fails
        assert!(res.is_err());
        assert!(sink.records.is_empty());
    }

    #[test]
    fn failing_prepare_ends_pipeline() {
        let (signals, alignments) = inputs();
        let mut sink = VecSink::default();

        let res = call_mods(
            signals,
            || Ok(alignments.clone()),
            || -> Result<MeanModel> { bail!("no device") },
            &mut sink,
            metadata(),
            &config(),
        );

        let err = res.unwrap_err();
        assert_eq!(err.to_string(), "Cannot prepare model");
    }

    #[test]
    fn failing_worker_stops_other_workers() {
        let n_reads = 40;
        let signals = FakeSignals {
            records: (0..n_reads)
                .map(|i| signal_record(&format!("r{}", i), 40))
                .collect(),
        };
        let mut alignments = FakeAlignments::default();
        for i in 0..n_reads {
            let name = format!("r{}", i);
            alignments
                .records
                .insert(name.clone(), vec![alignment(&name, SEQ)]);
        }

        // the first model fails to load, the other one is slow
        let prepared = AtomicUsize::new(0);
        let mut sink = VecSink::default();
        let res = call_mods(
            signals,
            || Ok(alignments.clone()),
            || -> Result<SlowModel> {
                if prepared.fetch_add(1, Ordering::SeqCst) == 0 {
                    bail!("no device");
                }
                Ok(SlowModel)
            },
            &mut sink,
            metadata(),
            &config(),
        );

        assert_eq!(res.unwrap_err().to_string(), "Cannot prepare model");
        assert!(sink.records.len() < n_reads);
        assert!(sink.finished);
    }

    #[test]
    fn failing_alignment_source_ends_pipeline() {
        let (signals, _) = inputs();
        let mut sink = VecSink::default();

        let res = call_mods(
            signals,
            || -> Result<FakeAlignments> { bail!("missing file") },
            || Ok(MeanModel),
            &mut sink,
            metadata(),
            &config(),
        );

        assert!(res.is_err());
        assert!(sink.records.is_empty());
    }

    #[test]
    fn duplex_pipeline() {
        let complement_seq = revcomp(SEQ);
        let signals = FakeSignals {
            records: vec![signal_record("t", 40), signal_record("c", 40)],
        };

        let mut simplex = FakeAlignments::default();
        simplex
            .records
            .insert("t".to_owned(), vec![alignment("t", SEQ)]);
        simplex
            .records
            .insert("c".to_owned(), vec![alignment("c", &complement_seq)]);

        let duplex_record = RecordBuf::builder()
            .set_name("t;c")
            .set_sequence(Sequence::from(SEQ.to_vec()))
            .set_flags(Flags::UNMAPPED)
            .build();
        let mut duplex = FakeAlignments::default();
        duplex.records.insert(
            "t;c".to_owned(),
            vec![AlignmentRecord::new(duplex_record, None)],
        );

        let pairs = vec![
            ("t".to_owned(), "c".to_owned()),
            ("t".to_owned(), "missing".to_owned()),
        ];
        let mut sink = VecSink::default();
        let summary = call_duplex_mods(
            signals,
            pairs,
            || Ok(simplex.clone()),
            || Ok(duplex.clone()),
            || Ok(MeanModel),
            &mut sink,
            metadata(),
            &config(),
        )
        .unwrap();

        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.failures.total(), 1);
        assert_eq!(
            summary.failures.get(&ReadError::SignalNotFound.to_string()),
            1
        );

        let record = &sink.records[0];
        assert_eq!(record.name().unwrap().to_string(), "t;c");
        let tags = mod_tags_from_record(record).unwrap().unwrap();
        assert_eq!(tags.mm, "C+m?,0,0,0;C-m?,0,0,0;");
        assert_eq!(tags.ml.len(), 6);

        let calls = parse_mm_ml_tags(SEQ, &tags).unwrap();
        assert_eq!(calls[0].positions, vec![1, 3, 7]);
        assert_eq!(calls[1].positions, vec![2, 4, 8]);
    }

    #[test]
    fn pipeline_in_alignment_order() {
        let (signals, _) = inputs();
        let records = vec![
            Ok(alignment("r2", SEQ)),
            Ok(alignment("r1", SEQ)),
            Ok(alignment("r5", SEQ)),
            Ok(alignment("r6", SEQ)),
            Ok(alignment("r2", SEQ)),
        ];
        let mut sink = VecSink::default();

        let summary = call_mods_from_alignments(
            records,
            || Ok(signals.clone()),
            || Ok(MeanModel),
            &mut sink,
            metadata(),
            &config(),
        )
        .unwrap();

        assert!(sink.finished);
        assert_eq!(summary.emitted, 3);
        let mut names: Vec<_> = sink
            .records
            .iter()
            .map(|r| r.name().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["r1", "r2", "r2"]);
        for record in sink.records.iter() {
            let tags = mod_tags_from_record(record).unwrap().unwrap();
            assert_eq!(tags.mm, "C+m?,0,0,0;");
        }

        let failures = &summary.failures;
        assert_eq!(failures.total(), 2);
        assert_eq!(failures.get(&ReadError::SignalNotFound.to_string()), 1);
        assert_eq!(
            failures.get(&ReadError::DiscordantMoveTable(Discordance::Signal).to_string()),
            1
        );
    }

    #[test]
    fn unreadable_alignment_record_fails_run() {
        let (signals, _) = inputs();
        let records = vec![Ok(alignment("r1", SEQ)), Err(anyhow!("truncated file"))];
        let mut sink = VecSink::default();

        let res = call_mods_from_alignments(
            records,
            || Ok(signals.clone()),
            || Ok(MeanModel),
            &mut sink,
            metadata(),
            &config(),
        );

        assert_eq!(res.unwrap_err().to_string(), "truncated file");
        assert!(sink.finished);
    }
}
