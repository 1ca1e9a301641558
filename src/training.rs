use std::{fs, path::PathBuf};

use burn::{
    config::Config,
    module::Module,
    optim::AdamWConfig,
    record::{BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings},
    tensor::backend::{AutodiffBackend, Backend},
    train::LearnerBuilder,
};

use crate::{
    data_module::{ChartDataModule, Stage},
    error::{self, ChartError},
    metric::{BenetechScoreMetric, ChartLossMetric},
    model::chart_to_text::{ModelPreset, Pix2Struct, Pix2StructConfig},
    parse_config::{Precision, RunConfig},
    utils::text_processor::TextProcessor,
};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model_config: Pix2StructConfig,
    pub num_workers: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub learning_rate: f64,
    pub grads_accumulation: usize,
    pub max_patches: usize,
    pub max_length: usize,
}

/// Trains on `config` and returns the path of the saved model, if any.
pub fn train<B: AutodiffBackend>(
    config: &RunConfig,
    devices: Vec<B::Device>,
) -> error::Result<Option<PathBuf>> {
    config.validate()?;
    let main_device = devices
        .first()
        .cloned()
        .ok_or_else(|| ChartError::Config("no device to train on".to_string()))?;
    B::seed(config.seed);

    let preset = ModelPreset::from_model_path(&config.model_path)?;
    let processor = TextProcessor::from_file(&config.processor_path)?;
    let mut data_module = ChartDataModule::new(config, processor.clone());
    let model_config = preset
        .config(
            processor.vocab_size(),
            data_module.extractor().patch_input_size(),
        )
        .with_max_new_tokens(config.max_length)
        .with_pad_token_id(processor.special_tokens.pad_id as usize)
        .with_eos_token_id(processor.special_tokens.eos_id as usize);
    tracing::info!("building {} with {:?}", config.model_path, preset);

    data_module.setup(Stage::Fit)?;
    let dataloader_train = data_module.train_dataloader::<B>(main_device.clone())?;
    let dataloader_valid = data_module.val_dataloader::<B::InnerBackend>(main_device.clone())?;

    let mut model = model_config.init::<B>(&main_device);
    if let Some(weights) = &config.model_weights {
        tracing::info!("loading pretrained weights from {weights}");
        model = model
            .load_file(
                weights,
                &BinFileRecorder::<FullPrecisionSettings>::new(),
                &main_device,
            )
            .map_err(|err| ChartError::Recorder(format!("{err:?}")))?;
    }

    let artifact_dir = format!("{}{}", config.model_save_dir, config.run_name());
    fs::create_dir_all(&artifact_dir)?;
    let num_epochs = if config.fast_dev_run { 1 } else { config.epochs };
    TrainingConfig::new(
        model_config,
        config.num_workers,
        num_epochs,
        config.batch_size,
        config.seed,
        config.learning_rate,
        config.accumulate_grad_batches,
        config.max_patches,
        config.max_length,
    )
    .save(format!("{artifact_dir}/config.json"))?;

    let learner = LearnerBuilder::new(&artifact_dir)
        .metric_train_numeric(ChartLossMetric::<B>::new())
        .metric_valid_numeric(ChartLossMetric::<B::InnerBackend>::new())
        .metric_valid_numeric(BenetechScoreMetric::new(processor))
        .with_file_checkpointer(BinFileRecorder::<FullPrecisionSettings>::new())
        .grads_accumulation(config.accumulate_grad_batches)
        .devices(devices)
        .num_epochs(num_epochs)
        .summary()
        .build(model, AdamWConfig::new().init(), config.learning_rate);

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    save_trained(&model_trained, config)
}

/// Saves the model to `<model_save_dir><run_name>.bin` unless saving is
/// disabled or the run is a fast dev run.
pub fn save_trained<B: Backend>(
    model: &Pix2Struct<B>,
    config: &RunConfig,
) -> error::Result<Option<PathBuf>> {
    if !config.save_model || config.fast_dev_run {
        tracing::info!("model saving is disabled for this run");
        return Ok(None);
    }

    fs::create_dir_all(&config.model_save_dir)?;
    let path = PathBuf::from(format!("{}{}", config.model_save_dir, config.run_name()));
    let saved = match config.precision()? {
        Precision::Full => model
            .clone()
            .save_file(path.clone(), &BinFileRecorder::<FullPrecisionSettings>::new()),
        Precision::Half => model
            .clone()
            .save_file(path.clone(), &BinFileRecorder::<HalfPrecisionSettings>::new()),
    };
    saved.map_err(|err| ChartError::Recorder(format!("{err:?}")))?;

    let path = path.with_extension("bin");
    tracing::info!("saved trained model to {}", path.display());

    Ok(Some(path))
}
