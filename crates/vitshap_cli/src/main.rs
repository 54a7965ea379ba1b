//! vitshap CLI for inspecting, running and smoke-training surrogate models.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use serde_json::Value;
use vitshap_core::{MaskLocation, PlayerMask};
use vitshap_models::{default_registry, SurrogateConfig, SurrogateModel};
use vitshap_train::{
    FrozenClassifier, ScheduleConfig, SurrogateBatch, SurrogateTrainer, TrainerConfig,
};

/// Backend for inference.
type InferBackend = NdArray;

/// Backend for training.
type TrainBackend = Autodiff<NdArray>;

#[derive(Parser)]
#[command(name = "vitshap")]
#[command(author, version)]
#[command(about = "Masking-aware surrogate models for Shapley value attribution")]
#[command(long_about = "vitshap: surrogate models that evaluate images with subsets of patches removed.

EXAMPLES:
  # List the registered backbones and their mask locations
  vitshap backbones

  # Build a surrogate from a JSON config and print its settings
  vitshap inspect --config surrogate.json

  # Run a masked forward pass on random images
  vitshap forward --config surrogate.json --batch 4 --keep-prob 0.5

  # Fit a surrogate to a randomly initialized target for a few steps
  vitshap smoke-train --config surrogate.json --target vit_tiny_patch16_224 --steps 4")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered backbones
    Backbones,
    /// Build a surrogate and print its settings
    Inspect {
        /// Surrogate config (JSON)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Masked forward pass on random images
    Forward {
        /// Surrogate config (JSON)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Number of images
        #[arg(long, default_value = "2", value_name = "N")]
        batch: usize,

        /// Probability of keeping each player
        #[arg(long, default_value = "0.5", value_name = "P")]
        keep_prob: f64,

        /// Mask location override (zero-input, zero-embedding, pre-softmax, post-softmax, random-sampling)
        #[arg(long, value_name = "LOCATION")]
        location: Option<String>,

        /// Random seed
        #[arg(long, default_value = "42", value_name = "SEED")]
        seed: u64,
    },
    /// Fit a surrogate to a target backbone on random images
    SmokeTrain {
        /// Surrogate config (JSON)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Registry name of the target backbone
        #[arg(long, value_name = "NAME")]
        target: String,

        /// Optimizer steps
        #[arg(long, default_value = "4", value_name = "N")]
        steps: usize,

        /// Images per step
        #[arg(long, default_value = "2", value_name = "N")]
        batch: usize,

        /// Peak learning rate
        #[arg(long, default_value = "0.0001", value_name = "LR")]
        lr: f64,

        /// Directory for the best checkpoint
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Random seed
        #[arg(long, default_value = "42", value_name = "SEED")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Backbones => handle_backbones(),
        Commands::Inspect { config } => handle_inspect(config),
        Commands::Forward {
            config,
            batch,
            keep_prob,
            location,
            seed,
        } => handle_forward(config, batch, keep_prob, location, seed),
        Commands::SmokeTrain {
            config,
            target,
            steps,
            batch,
            lr,
            output,
            seed,
        } => handle_smoke_train(config, target, steps, batch, lr, output, seed),
    }
}

fn handle_backbones() -> Result<()> {
    let registry = default_registry::<InferBackend>();
    println!("Registered backbones:\n");
    for name in registry.list() {
        let kind = registry.kind_of(name)?;
        let locations: Vec<&str> = kind
            .supported_locations()
            .iter()
            .map(|l| l.as_str())
            .collect();
        println!("  {:<26} {:<12} {}", name, kind.to_string(), locations.join(", "));
    }
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<SurrogateConfig> {
    SurrogateConfig::from_json_file(path)
        .with_context(|| format!("Failed to load surrogate config '{}'", path.display()))
}

fn handle_inspect(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let device = <InferBackend as Backend>::Device::default();
    let built = SurrogateModel::<InferBackend>::build(&config, &default_registry(), &device)
        .context("Failed to build surrogate")?;
    let settings = built.model.settings();
    let state = built.model.state_dict();

    println!("Surrogate: {}", settings.backbone_type);
    println!("─────────────────────────────────────────");
    println!("  Backbone family: {}", settings.kind);
    println!("  Mask location:   {}", settings.mask_location);
    println!("  Target type:     {}", settings.target_type);
    println!("  Players:         {}", settings.num_players);
    println!("  Feature width:   {}", settings.feature_width);
    println!("  Output dim:      {}", settings.output_dim);
    println!("  Parameters:      {} tensors, {} values", state.len(), state.numel());

    if let Some(report) = &built.pretrained_report {
        println!(
            "  Pretrained:      {} loaded, {} missing, {} unexpected",
            report.loaded.len(),
            report.missing_keys.len(),
            report.unexpected_keys.len()
        );
    }
    if let Some(report) = &built.checkpoint_report {
        println!(
            "  Checkpoint:      {} loaded, {} missing, {} unexpected, {} mismatched",
            report.loaded.len(),
            report.missing_keys.len(),
            report.unexpected_keys.len(),
            report.mismatched_keys.len()
        );
    }
    Ok(())
}

fn parse_location(location: &str) -> Result<MaskLocation> {
    MaskLocation::ALL
        .into_iter()
        .find(|l| l.as_str() == location)
        .with_context(|| {
            format!(
                "Unknown mask location '{}'. Expected one of: {}",
                location,
                MaskLocation::ALL.map(|l| l.as_str()).join(", ")
            )
        })
}

fn handle_forward(
    config_path: PathBuf,
    batch: usize,
    keep_prob: f64,
    location: Option<String>,
    seed: u64,
) -> Result<()> {
    if batch == 0 {
        bail!("--batch must be positive");
    }
    if !(0.0..=1.0).contains(&keep_prob) {
        bail!("--keep-prob must be in [0, 1], got {}", keep_prob);
    }
    let location = location.as_deref().map(parse_location).transpose()?;

    InferBackend::seed(seed);
    let config = load_config(&config_path)?;
    let device = <InferBackend as Backend>::Device::default();
    let model = SurrogateModel::<InferBackend>::new(&config, &device).context("Failed to build surrogate")?;

    let (height, width) = model.backbone().patch_grid().image_hw();
    let images = Tensor::<InferBackend, 4>::random([batch, 3, height, width], Distribution::Normal(0.0, 1.0), &device);
    let masks = Tensor::<InferBackend, 2>::random([batch, model.num_players()], Distribution::Uniform(0.0, 1.0), &device)
        .lower_elem(keep_prob)
        .float();
    let masks = PlayerMask::new(masks, model.num_players())?;
    let kept: Vec<f32> = masks.inner().clone().sum_dim(1).into_data().iter::<f32>().collect();

    let output = model.masked_forward(images, masks.into_inner(), location)?;
    let logits: Vec<f32> = output.logits.into_data().iter::<f32>().collect();

    println!(
        "Masked forward: {} images, {} players, location {}",
        batch,
        model.num_players(),
        location.unwrap_or(model.mask_location())
    );
    for (i, row) in logits.chunks(model.output_dim()).enumerate() {
        let row: Vec<String> = row.iter().map(|v| format!("{:+.4}", v)).collect();
        println!("  [{}] kept {:>4} players: {}", i, kept[i] as usize, row.join(" "));
    }
    Ok(())
}

fn handle_smoke_train(
    config_path: PathBuf,
    target: String,
    steps: usize,
    batch: usize,
    lr: f64,
    output: Option<PathBuf>,
    seed: u64,
) -> Result<()> {
    if steps == 0 || batch == 0 {
        bail!("--steps and --batch must be positive");
    }
    TrainBackend::seed(seed);
    let config = load_config(&config_path)?;
    let device = <TrainBackend as Backend>::Device::default();

    let model = SurrogateModel::<TrainBackend>::new(&config, &device).context("Failed to build surrogate")?;

    // The target shares the surrogate's architecture overrides and predicts output_dim classes.
    let mut target_overrides = match &config.backbone_overrides {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    target_overrides.insert("num_classes".to_string(), Value::from(config.output_dim));
    let target_model = FrozenClassifier::<InferBackend>::from_registry(
        &default_registry(),
        &target,
        &Value::Object(target_overrides),
        &device,
    )
    .with_context(|| format!("Failed to build target '{}'", target))?;

    let (height, width) = model.backbone().patch_grid().image_hw();
    let num_players = model.num_players();
    let make_images = |n: usize| {
        Tensor::<InferBackend, 4>::random([n, 3, height, width], Distribution::Normal(0.0, 1.0), &device)
    };
    let make_masks = |n: usize| {
        Tensor::<InferBackend, 2>::random([n, num_players], Distribution::Uniform(0.0, 1.0), &device)
            .lower_elem(0.5)
            .float()
    };
    let train: Vec<SurrogateBatch<TrainBackend>> = (0..steps)
        .map(|_| {
            SurrogateBatch::new(
                Tensor::from_inner(make_images(batch)),
                Tensor::from_inner(make_masks(batch)),
            )
        })
        .collect();
    let valid = vec![SurrogateBatch::new(make_images(batch), make_masks(batch))];

    let trainer_config = TrainerConfig {
        n_epochs: 1,
        schedule: ScheduleConfig {
            learning_rate: lr,
            ..Default::default()
        },
        checkpoint_dir: output,
        ..Default::default()
    };
    let mut trainer = SurrogateTrainer::<TrainBackend, _>::new(
        trainer_config,
        target_model,
        config.target_type,
        device,
    );

    println!("Smoke-training {} against {} for {} steps...", config.backbone_type, target, steps);
    let result = trainer.fit(model, &train, &valid)?;
    for record in &result.history {
        print!(
            "  epoch {}: train/loss={:.4} train/agreement={:.4}",
            record.epoch + 1,
            record.train.loss,
            record.train.agreement
        );
        if let Some(valid) = &record.valid {
            print!(" val/loss={:.4} val/agreement={:.4}", valid.loss, valid.agreement);
        }
        println!();
    }
    println!(
        "Done: {} steps in {:.1}s",
        result.global_step, result.training_time_secs
    );
    Ok(())
}
