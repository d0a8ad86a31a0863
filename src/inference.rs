use std::{fs::File, io::BufReader, path::Path};

use anyhow::{bail, ensure, Context, Result};
use bio::alphabets::dna::revcomp;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use noodles::sam::alignment::RecordBuf;
use serde::Deserialize;

use crate::{
    alignments::AlignmentSource,
    chunks::{CanonicalRead, ChunkParams, Motif},
    dataset::{Batch, BatchDataset, DatasetParams, SeqJustify},
    duplex::{duplex_read_name, DuplexRead},
    errors::{ErrorFlag, ReadError, ReadResult},
    read::{Read, Strand},
    signal::SignalRecord,
    tags::{format_mm_ml_tags, rewrite_mod_tags, ModTags},
};

/// Signal mapping refinement settings. Loaded and validated, refinement itself
/// is not applied.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SigMapRefiner {
    #[serde(default)]
    pub kmer_levels: Vec<f32>,
    #[serde(default)]
    pub kmer_len: usize,
    #[serde(default)]
    pub center_idx: usize,
    #[serde(default)]
    pub do_rough_rescale: bool,
    #[serde(default)]
    pub scale_iters: i32,
}

impl SigMapRefiner {
    pub fn is_loaded(&self) -> bool {
        !self.kmer_levels.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if !self.is_loaded() {
            return Ok(());
        }

        ensure!(
            self.center_idx < self.kmer_len,
            "Refiner center index {} outside its {}-mers",
            self.center_idx,
            self.kmer_len
        );
        let expected = 4usize
            .checked_pow(self.kmer_len as u32)
            .context("Refiner k-mer length too large")?;
        ensure!(
            self.kmer_levels.len() == expected,
            "Expected {} refiner levels, got {}",
            expected,
            self.kmer_levels.len()
        );

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelMetadata {
    pub chunk_context: (usize, usize),
    pub kmer_context_bases: (usize, usize),
    pub motifs: Vec<(String, usize)>,
    // One character per modification class, e.g. `"hm"`.
    pub mod_bases: String,
    #[serde(default)]
    pub mod_long_names: Vec<String>,
    #[serde(default)]
    pub can_base: Option<char>,
    #[serde(default)]
    pub base_start_justify: bool,
    #[serde(default)]
    pub offset: isize,
    #[serde(default)]
    pub seq_justify: SeqJustify,
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default)]
    pub sig_map_refiner: Option<SigMapRefiner>,
}

impl ModelMetadata {
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Cannot open model metadata {}", path.display()))?;
        let metadata: ModelMetadata = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Cannot parse model metadata {}", path.display()))?;

        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.motifs.is_empty(), "Model metadata lists no motifs");
        ensure!(
            self.chunk_context.0 + self.chunk_context.1 > 0,
            "Chunk context must be positive"
        );
        ensure!(
            !self.mod_bases.is_empty(),
            "Model metadata lists no modified bases"
        );
        ensure!(
            self.mod_bases.is_ascii(),
            "Modified base codes must be ASCII"
        );
        if !self.mod_long_names.is_empty() {
            ensure!(
                self.mod_long_names.len() == self.mod_bases.len(),
                "Got {} modified bases but {} long names",
                self.mod_bases.len(),
                self.mod_long_names.len()
            );
        }
        if let Some(n) = self.num_classes {
            ensure!(
                n == self.mod_bases.len() + 1,
                "Model has {} classes but {} modified bases",
                n,
                self.mod_bases.len()
            );
        }

        let motifs = self.motifs()?;
        let can_base = motifs[0].can_base();
        if motifs.iter().any(|m| m.can_base() != can_base) {
            bail!("All motifs must share one canonical base");
        }
        if let Some(b) = self.can_base {
            ensure!(
                b.to_ascii_uppercase() as u32 == can_base as u32,
                "Canonical base {} does not match motif base {}",
                b,
                can_base as char
            );
        }
        if let Some(ref refiner) = self.sig_map_refiner {
            refiner.validate()?;
        }

        Ok(())
    }

    pub fn motifs(&self) -> Result<Vec<Motif>> {
        self.motifs
            .iter()
            .map(|(raw, focus)| Motif::new(raw, *focus))
            .collect()
    }

    pub fn can_base(&self) -> Result<u8> {
        match self.can_base {
            Some(b) if b.is_ascii() => Ok(b.to_ascii_uppercase() as u8),
            Some(b) => bail!("Invalid canonical base {}", b),
            None => Ok(self.motifs()?[0].can_base()),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes.unwrap_or(self.mod_bases.len() + 1)
    }

    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            chunk_context: self.chunk_context,
            kmer_context_bases: self.kmer_context_bases,
            base_start_justify: self.base_start_justify,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelInput {
    // [B, 1, chunk_len]
    pub signals: Array3<f32>,
    // [B, 4 * kmer_len, chunk_len]
    pub kmers: Array3<f32>,
}

impl From<&Batch> for ModelInput {
    fn from(batch: &Batch) -> Self {
        ModelInput {
            signals: batch.signals.clone(),
            kmers: batch.encode_kmers(),
        }
    }
}

/// Scores every chunk of a batch.
///
/// Returns one row of raw class scores per chunk, canonical class first.
pub trait ModInference {
    fn infer(&self, input: &ModelInput) -> Result<Array2<f32>>;
}

impl<M: ModInference + ?Sized> ModInference for Box<M> {
    fn infer(&self, input: &ModelInput) -> Result<Array2<f32>> {
        (**self).infer(input)
    }
}

#[cfg(feature = "torch")]
pub use torch::TorchModel;

#[cfg(feature = "torch")]
mod torch {
    use std::path::Path;

    use anyhow::{Context, Result};
    use ndarray::{Array2, Array3};
    use tch::{CModule, Device, Kind, Tensor};

    use super::{ModInference, ModelInput};

    pub struct TorchModel {
        model: CModule,
        device: Device,
    }

    impl TorchModel {
        pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
            let model_path = model_path.as_ref();
            let mut model = CModule::load_on_device(model_path, device)
                .with_context(|| format!("Cannot load model {}", model_path.display()))?;
            model.set_eval();

            Ok(TorchModel { model, device })
        }
    }

    fn to_tensor(array: &Array3<f32>, device: Device) -> Result<Tensor> {
        let shape: Vec<_> = array.shape().iter().map(|&d| d as i64).collect();
        let contiguous = array.as_standard_layout();
        let data = contiguous
            .as_slice()
            .context("Cannot view input array as a slice")?;

        Ok(Tensor::from_slice(data).reshape(&shape).to(device))
    }

    impl ModInference for TorchModel {
        fn infer(&self, input: &ModelInput) -> Result<Array2<f32>> {
            let _no_grad = tch::no_grad_guard();

            let signals = to_tensor(&input.signals, self.device)?;
            let kmers = to_tensor(&input.kmers, self.device)?;
            let output = self
                .model
                .forward_ts(&[signals, kmers])?
                .to_device(Device::Cpu)
                .to_kind(Kind::Float);

            let size = output.size();
            let (rows, cols) = match size[..] {
                [rows, cols] => (rows as usize, cols as usize),
                _ => anyhow::bail!("Unexpected model output shape {:?}", size),
            };
            let scores = Vec::<f32>::try_from(output.flatten(0, -1))?;

            Ok(Array2::from_shape_vec((rows, cols), scores)?)
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;

    use anyhow::{Context, Result};
    use ndarray::{Array2, Array3};
    use ort::{session::Session, value::Tensor};

    use super::{ModInference, ModelInput};

    pub struct OnnxModel {
        session: Session,
    }

    impl OnnxModel {
        pub fn load<P: AsRef<Path>>(model_path: P, num_threads: usize) -> Result<Self> {
            let model_path = model_path.as_ref();
            let session = Session::builder()?
                .with_intra_threads(num_threads)?
                .commit_from_file(model_path)
                .with_context(|| format!("Cannot load model {}", model_path.display()))?;

            Ok(OnnxModel { session })
        }
    }

    fn to_tensor(array: &Array3<f32>) -> Result<Tensor<f32>> {
        let shape: Vec<_> = array.shape().iter().map(|&d| d as i64).collect();
        let data = array.as_standard_layout().iter().copied().collect::<Vec<_>>();

        Ok(Tensor::from_array((shape, data))?)
    }

    impl ModInference for OnnxModel {
        fn infer(&self, input: &ModelInput) -> Result<Array2<f32>> {
            let outputs = self.session.run(ort::inputs![
                "sig" => to_tensor(&input.signals)?,
                "seq" => to_tensor(&input.kmers)?
            ]?)?;

            let (shape, scores) = outputs[0].try_extract_raw_tensor::<f32>()?;
            let (rows, cols) = match shape[..] {
                [rows, cols] => (rows as usize, cols as usize),
                _ => anyhow::bail!("Unexpected model output shape {:?}", shape),
            };

            Ok(Array2::from_shape_vec((rows, cols), scores.to_vec())?)
        }
    }
}

pub fn softmax(scores: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = scores.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    probs
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadMods {
    pub positions: Vec<usize>,
    // [positions, modified bases]
    pub probs: Array2<f32>,
}

#[derive(Debug, Clone)]
pub struct ModCaller {
    metadata: ModelMetadata,
    motifs: Vec<Motif>,
    can_base: u8,
    chunk_params: ChunkParams,
    batch_size: usize,
    focus_offset: Option<usize>,
}

impl ModCaller {
    pub fn new(
        metadata: ModelMetadata,
        batch_size: usize,
        focus_offset: Option<usize>,
    ) -> Result<Self> {
        metadata.validate()?;
        ensure!(batch_size > 0, "Batch size must be positive");
        if metadata
            .sig_map_refiner
            .as_ref()
            .map_or(false, SigMapRefiner::is_loaded)
        {
            warn!("Model carries signal mapping refinement levels, calling on unrefined mappings");
        }

        Ok(ModCaller {
            motifs: metadata.motifs()?,
            can_base: metadata.can_base()?,
            chunk_params: metadata.chunk_params(),
            metadata,
            batch_size,
            focus_offset,
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn select_focus_bases(&self, read: &mut CanonicalRead) {
        match self.focus_offset {
            Some(offset) => read.set_focus_bases(vec![offset]),
            None => read.add_motif_focus_bases(&self.motifs),
        }
    }

    pub fn call_read_mods<M: ModInference + ?Sized>(
        &self,
        read: &Read,
        model: &M,
        use_reference_anchor: bool,
    ) -> ReadResult<ReadMods> {
        let canonical = read.into_canonical(use_reference_anchor)?;
        self.call_canonical_mods(canonical, model)
    }

    pub fn call_canonical_mods<M: ModInference + ?Sized>(
        &self,
        mut read: CanonicalRead,
        model: &M,
    ) -> ReadResult<ReadMods> {
        self.select_focus_bases(&mut read);

        let chunks: Vec<_> = read.iter_chunks(&self.chunk_params).collect();
        let n_mods = self.metadata.mod_bases.len();
        if chunks.is_empty() {
            return Ok(ReadMods {
                positions: Vec::new(),
                probs: Array2::zeros((0, n_mods)),
            });
        }

        let params = DatasetParams {
            chunk_context: self.chunk_params.chunk_context,
            kmer_context_bases: self.chunk_params.kmer_context_bases,
            max_seq_len: chunks.iter().map(|c| c.seq_len()).max().unwrap_or(0),
            batch_size: self.batch_size,
            seq_justify: self.metadata.seq_justify,
            drop_last: false,
        };
        let mut dataset = BatchDataset::new(chunks.len(), params);
        for chunk in chunks {
            dataset.add_chunk(chunk)?;
        }

        let mut positions = Vec::with_capacity(dataset.len());
        let mut probs = Vec::with_capacity(dataset.len() * n_mods);
        for batch in dataset.seal().batches() {
            let scores = model
                .infer(&ModelInput::from(&batch))
                .map_err(|e| ReadError::Inference(e.to_string()))?;
            if scores.nrows() != batch.len() || scores.ncols() != self.metadata.num_classes() {
                debug!(
                    "Model returned {:?} scores for {} chunks of {}",
                    scores.shape(),
                    batch.len(),
                    read.read_id
                );
                return Err(ReadError::Inference(
                    "unexpected model output shape".to_owned(),
                ));
            }

            let batch_probs = softmax(scores.view());
            probs.extend(batch_probs.slice(s![.., 1..]).iter());
            positions.extend(batch.read_positions);
        }

        let probs = Array2::from_shape_vec((positions.len(), n_mods), probs)
            .map_err(|e| ReadError::Inference(e.to_string()))?;

        Ok(ReadMods { positions, probs })
    }

    pub fn tag_read<M: ModInference + ?Sized>(
        &self,
        read: &Read,
        model: &M,
    ) -> ReadResult<ModTags> {
        let mods = self.call_read_mods(read, model, false)?;

        format_mm_ml_tags(
            read.seq(),
            &mods.positions,
            mods.probs.view(),
            self.metadata.mod_bases.as_bytes(),
            self.can_base,
            Strand::Forward,
        )
    }

    /// MM/ML pair covering both strands of a duplex read.
    ///
    /// Positions are expressed on the duplex basecalls. The simplex read running
    /// along them is tagged `+`, the other one `-`.
    pub fn tag_duplex<M: ModInference + ?Sized>(
        &self,
        duplex: &DuplexRead,
        model: &M,
    ) -> ReadResult<ModTags> {
        let stored = duplex.duplex_basecalled_sequence();
        let basecalls = if duplex.is_reverse_mapped {
            revcomp(&stored)
        } else {
            stored
        };

        // (read, offset on its duplex orientation, runs along basecalls)
        let mut strands = [
            (&duplex.template, duplex.template_offset, !duplex.is_reverse_mapped),
            (&duplex.complement, duplex.complement_offset, duplex.is_reverse_mapped),
        ];
        strands.sort_by_key(|(_, _, along)| !along);

        let mut tags = ModTags::default();
        for (read, offset, along) in strands {
            let mods = self.call_read_mods(read, model, false)?;
            let (positions, strand): (Vec<_>, _) = if along {
                let positions = mods.positions.iter().map(|p| p + offset).collect();
                (positions, Strand::Forward)
            } else {
                let last = basecalls.len() - 1;
                let positions = mods.positions.iter().map(|p| last - (p + offset)).collect();
                (positions, Strand::Reverse)
            };

            tags.append(format_mm_ml_tags(
                &basecalls,
                &positions,
                mods.probs.view(),
                self.metadata.mod_bases.as_bytes(),
                self.can_base,
                strand,
            )?);
        }

        Ok(tags)
    }
}

fn tag_read_group<M: ModInference + ?Sized>(
    caller: &ModCaller,
    model: &M,
    group: Vec<ReadResult<Read>>,
) -> Vec<ReadResult<RecordBuf>> {
    let tags = match group.iter().find_map(|r| r.as_ref().ok()) {
        Some(read) => {
            let tags = caller.tag_read(read, model);
            if let Err(ref e) = tags {
                debug!("Cannot call mods for {}: {}", read.read_id(), e);
            }

            tags
        }
        None => return group.into_iter().filter_map(Result::err).map(Err).collect(),
    };

    group
        .into_iter()
        .map(|read| {
            let read = read?;
            let tags = tags.as_ref().map_err(Clone::clone)?;
            let mut record = read.into_alignment().into_record();
            rewrite_mod_tags(&mut record, tags);

            Ok(record)
        })
        .collect()
}

// Stage 3: mod calling on basecalls.
pub(crate) fn mods_worker<M: ModInference + ?Sized>(
    caller: &ModCaller,
    model: &M,
    receiver: Receiver<Vec<ReadResult<Read>>>,
    sender: Sender<Vec<ReadResult<RecordBuf>>>,
    error_flag: &ErrorFlag,
) {
    loop {
        let group = match receiver.recv() {
            Ok(group) => group,
            Err(_) => break,
        };
        if error_flag.is_set() {
            break;
        }

        let records = tag_read_group(caller, model, group);
        if sender.send(records).is_err() {
            break;
        }
    }
}

fn first_read<S: AlignmentSource>(source: &mut S, signal: &SignalRecord) -> ReadResult<Read> {
    let record = source
        .records_for(&signal.read_id)?
        .into_iter()
        .next()
        .ok_or(ReadError::NoValidMappings)?;

    Read::from_signal_and_alignment(signal, record)
}

fn call_duplex<M, S, D>(
    caller: &ModCaller,
    model: &M,
    simplex: &mut S,
    duplex: &mut D,
    template: &SignalRecord,
    complement: &SignalRecord,
) -> ReadResult<RecordBuf>
where
    M: ModInference + ?Sized,
    S: AlignmentSource,
    D: AlignmentSource,
{
    let template_read = first_read(simplex, template)?;
    let complement_read = first_read(simplex, complement)?;

    let duplex_record = duplex
        .records_for(&duplex_read_name(&template.read_id, &complement.read_id))?
        .into_iter()
        .next()
        .ok_or(ReadError::NoValidMappings)?;

    let duplex_read =
        DuplexRead::from_reads_and_alignment(&template_read, &complement_read, duplex_record)?;
    let tags = caller.tag_duplex(&duplex_read, model)?;

    let mut record = duplex_read.duplex_alignment.into_record();
    rewrite_mod_tags(&mut record, &tags);

    Ok(record)
}

pub(crate) fn duplex_worker<M, S, D>(
    caller: &ModCaller,
    model: &M,
    mut simplex: S,
    mut duplex: D,
    receiver: Receiver<ReadResult<(SignalRecord, SignalRecord)>>,
    sender: Sender<Vec<ReadResult<RecordBuf>>>,
    error_flag: &ErrorFlag,
) where
    M: ModInference + ?Sized,
    S: AlignmentSource,
    D: AlignmentSource,
{
    loop {
        let pair = match receiver.recv() {
            Ok(pair) => pair,
            Err(_) => break,
        };
        if error_flag.is_set() {
            break;
        }

        let (template, complement) = match pair {
            Ok(pair) => pair,
            Err(e) => {
                if sender.send(vec![Err(e)]).is_err() {
                    break;
                }
                continue;
            }
        };

        let record = call_duplex(
            caller,
            model,
            &mut simplex,
            &mut duplex,
            &template,
            &complement,
        );
        if let Err(ref e) = record {
            debug!(
                "Cannot call duplex mods for {};{}: {}",
                template.read_id, complement.read_id, e
            );
        }

        if sender.send(vec![record]).is_err() {
            break;
        }
    }
}
