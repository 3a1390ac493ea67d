//! freebloom CLI
//!
//! Generates a consistent frame sequence from one prompt and writes it as
//! numbered PNG files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand, ValueEnum};
use freebloom::{
    plan_segments, AnimatorConfig, AttentionTopology, DecodedFrame, NoiseSharing, PreviewDecoder,
    PromptSequencer, ReferenceDenoiserConfig, SamplerEvent, SamplerKind, ScriptedSequencer,
    StagedSequencer,
};
use image::{ImageBuffer, Rgb};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

type Cpu = NdArray<f32>;

#[derive(Parser)]
#[command(name = "freebloom")]
#[command(about = "Zero-shot text-to-video with a frozen diffusion model")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a frame sequence from a text prompt
    Generate(GenerateArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file to load (defaults are printed otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write the reference denoiser's seeded weights to a record file
    InitWeights {
        /// Output record path
        #[arg(short, long, default_value = "freebloom-weights.bin")]
        output: PathBuf,

        /// Weight seed
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Base prompt describing the scene
    #[arg(short, long)]
    prompt: String,

    /// Stage phrases spread evenly over the frames (comma-separated)
    #[arg(long, value_delimiter = ',')]
    stages: Vec<String>,

    /// JSON array with one prompt per frame (overrides --stages)
    #[arg(long)]
    prompts: Option<PathBuf>,

    /// TOML configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames to generate
    #[arg(long)]
    frames: Option<usize>,

    /// Frames sampled together in one batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Initial noise sharing policy
    #[arg(long, value_enum)]
    noise: Option<NoiseArg>,

    /// Residual noise fraction for shared noise (0 = identical, 1 = independent)
    #[arg(long)]
    epsilon: Option<f32>,

    /// Which frames each frame attends to
    #[arg(long, value_enum)]
    topology: Option<TopologyArg>,

    /// Frames repeated between chained batches
    #[arg(long)]
    overlap: Option<usize>,

    /// Number of denoising steps
    #[arg(long)]
    steps: Option<usize>,

    /// Sampler algorithm
    #[arg(long, value_enum)]
    sampler: Option<SamplerArg>,

    /// Guidance scale
    #[arg(long)]
    guidance: Option<f32>,

    /// Per-step latent smoothing towards neighbouring frames
    #[arg(long)]
    smoothing: Option<f32>,

    /// Pull toward the first frame during the early steps
    #[arg(long)]
    anchor_blend: Option<f32>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Burn record with reference denoiser weights (seeded weights otherwise)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Directory for the frame images
    #[arg(short, long, default_value = "frames")]
    output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NoiseArg {
    Independent,
    SharedBase,
    Mixed,
}

impl From<NoiseArg> for NoiseSharing {
    fn from(arg: NoiseArg) -> Self {
        match arg {
            NoiseArg::Independent => NoiseSharing::Independent,
            NoiseArg::SharedBase => NoiseSharing::SharedBase,
            NoiseArg::Mixed => NoiseSharing::Mixed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    AnchorFirst,
    Chain,
    Full,
    AnchorChain,
}

impl From<TopologyArg> for AttentionTopology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::AnchorFirst => AttentionTopology::AnchorFirst,
            TopologyArg::Chain => AttentionTopology::Chain,
            TopologyArg::Full => AttentionTopology::Full,
            TopologyArg::AnchorChain => AttentionTopology::AnchorChain,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SamplerArg {
    Ddim,
    Euler,
    EulerAncestral,
}

impl From<SamplerArg> for SamplerKind {
    fn from(arg: SamplerArg) -> Self {
        match arg {
            SamplerArg::Ddim => SamplerKind::Ddim,
            SamplerArg::Euler => SamplerKind::Euler,
            SamplerArg::EulerAncestral => SamplerKind::EulerAncestral,
        }
    }
}

impl GenerateArgs {
    /// File configuration with command-line overrides applied
    fn config(&self) -> Result<AnimatorConfig> {
        let mut config = match &self.config {
            Some(path) => AnimatorConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AnimatorConfig::default(),
        };

        if let Some(frames) = self.frames {
            config.frame_count = frames;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(noise) = self.noise {
            config.noise_sharing = noise.into();
        }
        if let Some(epsilon) = self.epsilon {
            config.epsilon = epsilon;
        }
        if let Some(topology) = self.topology {
            config.attention_topology = topology.into();
        }
        if let Some(overlap) = self.overlap {
            config.overlap_size = overlap;
        }
        if let Some(steps) = self.steps {
            config.schedule_length = steps;
        }
        if let Some(sampler) = self.sampler {
            config.sampler = sampler.into();
        }
        if let Some(guidance) = self.guidance {
            config.guidance_scale = guidance;
        }
        if let Some(smoothing) = self.smoothing {
            config.smoothing_blend_factor = smoothing;
        }
        if let Some(weight) = self.anchor_blend {
            config.anchor_blend_weight = weight;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn sequencer(&self) -> Result<Box<dyn PromptSequencer>> {
        match &self.prompts {
            Some(path) => {
                let sequencer = ScriptedSequencer::from_file(path)
                    .with_context(|| format!("Failed to read prompts {}", path.display()))?;
                Ok(Box::new(sequencer))
            }
            None => Ok(Box::new(StagedSequencer::new(self.stages.clone()))),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("freebloom=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => run_generate(args),
        Commands::Config { config } => {
            let config = match config {
                Some(path) => AnimatorConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => AnimatorConfig::default(),
            };
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::InitWeights { output, seed } => {
            let device = Default::default();
            let model = ReferenceDenoiserConfig {
                seed,
                ..Default::default()
            }
            .init::<Cpu>(&device);
            model
                .save(&output)
                .with_context(|| format!("Failed to write weights {}", output.display()))?;
            println!("Saved weights to: {}", output.display());
            Ok(())
        }
    }
}

/// Denoising steps the whole run will report
fn planned_steps(config: &AnimatorConfig) -> u64 {
    let batches = plan_segments(config.frame_count, config.batch_size, config.overlap_size).len();
    ((batches + config.interpolation_passes) * config.schedule_length) as u64
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let config = args.config()?;
    let sequencer = args.sequencer()?;
    let device = Default::default();

    let mut model = ReferenceDenoiserConfig {
        channels: config.latent_channels,
        seed: config.seed,
        ..Default::default()
    }
    .init::<Cpu>(&device);
    if let Some(path) = &args.weights {
        model = model
            .load(path, &device)
            .with_context(|| format!("Failed to load weights {}", path.display()))?;
    }

    let pb = ProgressBar::new(planned_steps(&config));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} steps {msg}")?
            .progress_chars("#>-"),
    );
    let bar = pb.clone();
    let observer = Arc::new(move |event: &SamplerEvent| match event {
        SamplerEvent::BatchStarted { batch, frames, .. } => {
            bar.set_message(format!("batch {batch} ({frames} frames)"))
        }
        SamplerEvent::StepCompleted { .. } => bar.inc(1),
        _ => {}
    });

    info!(
        frames = config.frame_count,
        batch_size = config.batch_size,
        noise = ?config.noise_sharing,
        topology = ?config.attention_topology,
        "generating"
    );

    let animator = freebloom::Animator::<Cpu>::new(
        Arc::new(model.weights()),
        Arc::new(PreviewDecoder::default()),
        config,
        &device,
    )?
    .with_observer(observer);

    let report = animator.animate_report(sequencer.as_ref(), &args.prompt);
    pb.finish_and_clear();

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    for frame in &report.frames {
        save_frame(frame, &args.output_dir)?;
    }
    println!(
        "Saved {} frames to: {}",
        report.frames.len(),
        args.output_dir.display()
    );

    if let Some(failure) = report.failure {
        bail!(
            "generation stopped after {} batches: {failure}",
            report.completed_batches
        );
    }
    Ok(())
}

fn save_frame<B: Backend>(frame: &DecodedFrame<B>, dir: &Path) -> Result<()> {
    let (w, h) = frame.size();
    let rgb = frame.to_rgb8()?;
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(w as u32, h as u32, rgb)
        .context("Failed to create image buffer")?;

    let path = dir.join(format!("frame_{:04}.png", frame.index()));
    img.save(&path)
        .with_context(|| format!("Failed to save {}", path.display()))?;
    Ok(())
}
