use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use sigmods::{
    infer_duplex, infer_from_alignments_and_signal, infer_from_signal_and_alignments,
    inference::{ModInference, ModelMetadata},
    PipelineConfig,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call modified bases of simplex reads
    Infer {
        /// SLOW5 signal file
        signal_path: PathBuf,
        /// BAM file with move tables
        alignments_path: PathBuf,
        /// Output BAM file
        output_path: PathBuf,
        /// Walk the BAM file in its own order and fetch signals per record
        #[arg(long)]
        alignment_order: bool,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Call modified bases of duplex reads from their simplex signals
    Duplex {
        /// Pairs file, one `template complement` pair per line after a header
        pairs_path: PathBuf,
        /// SLOW5 signal file
        signal_path: PathBuf,
        /// BAM file with simplex move tables
        simplex_path: PathBuf,
        /// BAM file with duplex records
        duplex_path: PathBuf,
        /// Output BAM file
        output_path: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// TorchScript model, or ONNX model if it ends in `.onnx`
    #[arg(long)]
    model: PathBuf,
    /// JSON model metadata
    #[arg(long)]
    metadata: PathBuf,
    /// Inference device, `cpu` or `cuda:N`
    #[arg(short = 'd', long, default_value = "cpu")]
    device: String,
}

#[derive(Args)]
struct PipelineArgs {
    /// Alignment workers
    #[arg(short = 'a', long, default_value = "1")]
    alignment_workers: usize,
    /// Mod calling workers, each with its own model
    #[arg(short = 't', long, default_value = "1")]
    mod_workers: usize,
    #[arg(short = 'b', long, default_value = "1024")]
    batch_size: usize,
    #[arg(long, default_value = "1000")]
    queue_capacity: usize,
    /// Keep secondary and supplementary alignments
    #[arg(long)]
    keep_non_primary: bool,
    /// Call this read position instead of motif hits
    #[arg(long)]
    focus_offset: Option<usize>,
}

impl From<&PipelineArgs> for PipelineConfig {
    fn from(args: &PipelineArgs) -> Self {
        PipelineConfig {
            alignment_workers: args.alignment_workers,
            mod_workers: args.mod_workers,
            queue_capacity: args.queue_capacity,
            batch_size: args.batch_size,
            skip_non_primary: !args.keep_non_primary,
            focus_offset: args.focus_offset,
        }
    }
}

#[cfg(feature = "torch")]
fn parse_device(device: &str) -> Result<tch::Device> {
    match device {
        "cpu" => Ok(tch::Device::Cpu),
        "cuda" => Ok(tch::Device::Cuda(0)),
        d => match d.strip_prefix("cuda:").map(str::parse) {
            Some(Ok(idx)) => Ok(tch::Device::Cuda(idx)),
            _ => bail!("Unknown device {}", d),
        },
    }
}

#[cfg(feature = "torch")]
fn load_torch(args: &ModelArgs) -> Result<Box<dyn ModInference>> {
    tch::set_num_threads(1);
    let device = parse_device(&args.device)?;

    Ok(Box::new(sigmods::inference::TorchModel::load(
        &args.model,
        device,
    )?))
}

#[cfg(not(feature = "torch"))]
fn load_torch(args: &ModelArgs) -> Result<Box<dyn ModInference>> {
    bail!(
        "Cannot load {}: built without the torch feature",
        args.model.display()
    )
}

#[cfg(feature = "onnx")]
fn load_onnx(args: &ModelArgs) -> Result<Box<dyn ModInference>> {
    Ok(Box::new(sigmods::inference::OnnxModel::load(&args.model, 1)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(args: &ModelArgs) -> Result<Box<dyn ModInference>> {
    bail!(
        "Cannot load {}: built without the onnx feature",
        args.model.display()
    )
}

fn prepare_model(args: &ModelArgs) -> Result<Box<dyn ModInference>> {
    let is_onnx = args.model.extension().map_or(false, |ext| ext == "onnx");
    if !is_onnx {
        return load_torch(args);
    }

    if args.device != "cpu" {
        warn!("ONNX models run on the CPU, ignoring device {}", args.device);
    }
    load_onnx(args)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Infer {
            signal_path,
            alignments_path,
            output_path,
            alignment_order,
            model,
            pipeline,
        } => {
            let metadata = ModelMetadata::from_json(&model.metadata)?;
            let config = PipelineConfig::from(&pipeline);
            if alignment_order {
                infer_from_alignments_and_signal(
                    alignments_path,
                    signal_path,
                    output_path,
                    metadata,
                    || prepare_model(&model),
                    &config,
                )?;
            } else {
                infer_from_signal_and_alignments(
                    signal_path,
                    alignments_path,
                    output_path,
                    metadata,
                    || prepare_model(&model),
                    &config,
                )?;
            }
        }
        Commands::Duplex {
            pairs_path,
            signal_path,
            simplex_path,
            duplex_path,
            output_path,
            model,
            pipeline,
        } => {
            let metadata = ModelMetadata::from_json(&model.metadata)?;
            infer_duplex(
                pairs_path,
                signal_path,
                simplex_path,
                duplex_path,
                output_path,
                metadata,
                || prepare_model(&model),
                &PipelineConfig::from(&pipeline),
            )?;
        }
    }

    Ok(())
}
