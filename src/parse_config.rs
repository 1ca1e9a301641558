use std::{
    fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::{ChartError, Result};

/// Size of the row/column embedding tables of the patch encoder.
pub const MAX_PATCH_POSITIONS: usize = 4096;

#[derive(Serialize, Deserialize, Debug)]
struct DataYaml {
    data_dir: String,
    processor_path: String,
    max_patches: usize,
    max_length: usize,
    num_workers: usize,
}

#[derive(Serialize, Deserialize, Debug)]
struct ModelYaml {
    model_path: String,
    #[serde(default)]
    model_weights: Option<String>,
    model_save_dir: String,
    save_model: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct TrainingYaml {
    project: String,
    #[serde(default)]
    run_name: Option<String>,
    batch_size: usize,
    epochs: usize,
    learning_rate: f64,
    seed: u64,
    accelerator: Accelerator,
    devices: usize,
    precision: u32,
    fast_dev_run: bool,
    overfit_batches: usize,
    accumulate_grad_batches: usize,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct ChartTrainingConfigYaml {
    data: DataYaml,
    model: ModelYaml,
    training: TrainingYaml,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Gpu,
}

/// Numeric precision of the saved model records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Half,
    Full,
}

impl TryFrom<u32> for Precision {
    type Error = ChartError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(Precision::Half),
            32 => Ok(Precision::Full),
            other => Err(ChartError::UnsupportedPrecision(other)),
        }
    }
}

/// Every setting of a run, built once at startup and passed by reference.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub data_dir: String,
    pub processor_path: String,
    pub max_patches: usize,
    pub max_length: usize,
    pub num_workers: usize,
    pub model_path: String,
    pub model_weights: Option<String>,
    pub model_save_dir: String,
    pub save_model: bool,
    pub project: String,
    pub run_name: Option<String>,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub accelerator: Accelerator,
    pub devices: usize,
    pub precision: u32,
    pub fast_dev_run: bool,
    pub overfit_batches: usize,
    pub accumulate_grad_batches: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/benetech/".to_string(),
            processor_path: "./deplot/tokenizer.json".to_string(),
            max_patches: 1024,
            max_length: 512,
            num_workers: 4,
            model_path: "google/deplot".to_string(),
            model_weights: None,
            model_save_dir: "./models/".to_string(),
            save_model: true,
            project: "Benetech".to_string(),
            run_name: None,
            batch_size: 3,
            epochs: 1,
            learning_rate: 1e-5,
            seed: 0,
            accelerator: Accelerator::Gpu,
            devices: 1,
            precision: 32,
            fast_dev_run: false,
            overfit_batches: 0,
            accumulate_grad_batches: 1,
        }
    }
}

impl RunConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let yaml: ChartTrainingConfigYaml = serde_yaml::from_str(content)?;

        Ok(Self {
            data_dir: yaml.data.data_dir,
            processor_path: yaml.data.processor_path,
            max_patches: yaml.data.max_patches,
            max_length: yaml.data.max_length,
            num_workers: yaml.data.num_workers,
            model_path: yaml.model.model_path,
            model_weights: yaml.model.model_weights,
            model_save_dir: yaml.model.model_save_dir,
            save_model: yaml.model.save_model,
            project: yaml.training.project,
            run_name: yaml.training.run_name,
            batch_size: yaml.training.batch_size,
            epochs: yaml.training.epochs,
            learning_rate: yaml.training.learning_rate,
            seed: yaml.training.seed,
            accelerator: yaml.training.accelerator,
            devices: yaml.training.devices,
            precision: yaml.training.precision,
            fast_dev_run: yaml.training.fast_dev_run,
            overfit_batches: yaml.training.overfit_batches,
            accumulate_grad_batches: yaml.training.accumulate_grad_batches,
        })
    }

    /// Fills in a run name derived from the project and the current time
    /// when none was configured.
    pub fn with_resolved_run_name(mut self) -> Self {
        if self.run_name.is_none() {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default();
            self.run_name = Some(format!("{}-{secs}", self.project.to_lowercase()));
        }
        self
    }

    pub fn run_name(&self) -> &str {
        self.run_name.as_deref().unwrap_or("run")
    }

    pub fn precision(&self) -> Result<Precision> {
        Precision::try_from(self.precision)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_length", self.max_length),
            ("max_patches", self.max_patches),
            ("epochs", self.epochs),
            ("devices", self.devices),
            ("accumulate_grad_batches", self.accumulate_grad_batches),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ChartError::Config(format!("`{name}` must be greater than 0")));
        }
        if self.max_patches >= MAX_PATCH_POSITIONS {
            return Err(ChartError::Config(format!(
                "`max_patches` must be lower than {MAX_PATCH_POSITIONS}, got {}",
                self.max_patches
            )));
        }
        self.precision()?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const YAML: &str = r#"
DATA:
  data_dir: /data/charts/
  processor_path: /models/deplot
  max_patches: 512
  max_length: 256
  num_workers: 2
MODEL:
  model_path: google/deplot
  model_save_dir: /models/out/
  save_model: false
TRAINING:
  project: Benetech
  batch_size: 4
  epochs: 2
  learning_rate: 2.0e-5
  seed: 7
  accelerator: cpu
  devices: 1
  precision: 16
  fast_dev_run: false
  overfit_batches: 0
  accumulate_grad_batches: 2
"#;

    #[test]
    fn test_from_yaml_str() {
        let config = RunConfig::from_yaml_str(YAML).unwrap();

        assert_eq!(config.data_dir, "/data/charts/");
        assert_eq!(config.max_patches, 512);
        assert_eq!(config.model_weights, None);
        assert!(!config.save_model);
        assert_eq!(config.accelerator, Accelerator::Cpu);
        assert_eq!(config.precision().unwrap(), Precision::Half);
        assert_eq!(config.accumulate_grad_batches, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_section_fails() {
        let res = RunConfig::from_yaml_str("DATA:\n  data_dir: x\n");

        assert!(matches!(res, Err(ChartError::Yaml(_))));
    }

    #[test]
    fn test_validate() {
        let config = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChartError::Config(_))));

        let config = RunConfig {
            precision: 64,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ChartError::UnsupportedPrecision(64))
        ));

        let config = RunConfig {
            max_patches: MAX_PATCH_POSITIONS,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_run_name() {
        let config = RunConfig::default().with_resolved_run_name();
        assert!(config.run_name().starts_with("benetech-"));

        let config = RunConfig {
            run_name: Some("fixed".to_string()),
            ..RunConfig::default()
        }
        .with_resolved_run_name();
        assert_eq!(config.run_name(), "fixed");
    }
}
