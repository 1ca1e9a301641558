use std::path::PathBuf;

use clap::Parser;

use crate::{error::Result, parse_config::RunConfig};

/// Fine-tune a DePlot model on chart images.
#[derive(Parser, Debug, Default)]
#[command(version, about)]
pub struct Cli {
    /// YAML run configuration; built-in defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run a single train and validation batch to check the pipeline.
    #[arg(long)]
    pub fast_dev_run: bool,

    /// Seed for reproducibility.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of samples per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of batches to accumulate before each optimizer step.
    #[arg(long)]
    pub accumulate_grad_batches: Option<usize>,

    /// Maximum number of image patches per sample.
    #[arg(long)]
    pub max_patches: Option<usize>,
}

impl Cli {
    /// Loads the base configuration and applies the flags that were set.
    pub fn load_config(&self) -> Result<RunConfig> {
        let base = match &self.config {
            Some(path) => RunConfig::from_yaml(path)?,
            None => RunConfig::default(),
        };

        Ok(self.apply(base))
    }

    pub fn apply(&self, config: RunConfig) -> RunConfig {
        RunConfig {
            fast_dev_run: self.fast_dev_run || config.fast_dev_run,
            seed: self.seed.unwrap_or(config.seed),
            batch_size: self.batch_size.unwrap_or(config.batch_size),
            accumulate_grad_batches: self
                .accumulate_grad_batches
                .unwrap_or(config.accumulate_grad_batches),
            max_patches: self.max_patches.unwrap_or(config.max_patches),
            ..config
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unset_flags_keep_config() {
        let cli = Cli::parse_from(["chart-deplot"]);
        let config = cli.apply(RunConfig::default());

        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "chart-deplot",
            "--fast-dev-run",
            "--seed",
            "42",
            "--batch-size",
            "8",
            "--accumulate-grad-batches",
            "4",
            "--max-patches",
            "2048",
        ]);
        let config = cli.apply(RunConfig::default());

        assert!(config.fast_dev_run);
        assert_eq!(config.seed, 42);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.accumulate_grad_batches, 4);
        assert_eq!(config.max_patches, 2048);
        assert_eq!(config.max_length, RunConfig::default().max_length);
    }
}
