use std::sync::Arc;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    tensor::backend::Backend,
};

use crate::{
    dataset::{ChartBatch, ChartBatcher, ChartImgDataset, Split},
    error::{ChartError, Result},
    image_data::PatchExtractor,
    parse_config::RunConfig,
    utils::text_processor::TextProcessor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Test,
}

/// Owns the dataset splits of a run and builds the loaders over them.
pub struct ChartDataModule {
    data_dir: String,
    processor: TextProcessor,
    extractor: PatchExtractor,
    batch_size: usize,
    num_workers: usize,
    max_length: usize,
    seed: u64,
    fast_dev_run: bool,
    overfit_batches: usize,
    train_dataset: Option<ChartImgDataset>,
    valid_dataset: Option<ChartImgDataset>,
}

impl ChartDataModule {
    pub fn new(config: &RunConfig, processor: TextProcessor) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            processor,
            extractor: PatchExtractor::new(config.max_patches),
            batch_size: config.batch_size,
            num_workers: config.num_workers,
            max_length: config.max_length,
            seed: config.seed,
            fast_dev_run: config.fast_dev_run,
            overfit_batches: config.overfit_batches,
            train_dataset: None,
            valid_dataset: None,
        }
    }

    pub fn extractor(&self) -> &PatchExtractor {
        &self.extractor
    }

    fn dataset(&self, split: Split) -> Result<ChartImgDataset> {
        ChartImgDataset::from_image_folder(&self.data_dir, split, self.extractor)
    }

    pub fn setup(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Fit => {
                let train = self.dataset(Split::Train)?;
                let valid = self.dataset(Split::Validation)?;
                let (train, valid) = if self.fast_dev_run {
                    (
                        train.truncated(self.batch_size),
                        valid.truncated(self.batch_size),
                    )
                } else if self.overfit_batches > 0 {
                    let train = train.truncated(self.overfit_batches * self.batch_size);
                    (train.clone(), train)
                } else {
                    (train, valid)
                };
                self.train_dataset = Some(train);
                self.valid_dataset = Some(valid);
            }
            Stage::Test => {
                let valid = self.dataset(Split::Validation)?;
                self.valid_dataset = Some(match self.fast_dev_run {
                    true => valid.truncated(self.batch_size),
                    false => valid,
                });
            }
        }

        Ok(())
    }

    fn batcher<B: Backend>(&self, device: B::Device) -> ChartBatcher<B> {
        ChartBatcher::new(device, self.processor.clone(), self.max_length)
    }

    pub fn train_dataset(&self) -> Option<&ChartImgDataset> {
        self.train_dataset.as_ref()
    }

    pub fn valid_dataset(&self) -> Option<&ChartImgDataset> {
        self.valid_dataset.as_ref()
    }

    pub fn train_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChartBatch<B>>>> {
        let dataset = self
            .train_dataset
            .clone()
            .ok_or_else(|| ChartError::Config("train split is not set up".to_string()))?;

        let builder = DataLoaderBuilder::new(self.batcher::<B>(device))
            .batch_size(self.batch_size)
            .num_workers(self.num_workers);
        // overfit runs replay the validation batches in order
        let builder = match self.overfit_batches {
            0 => builder.shuffle(self.seed),
            _ => builder,
        };

        Ok(builder.build(dataset))
    }

    pub fn val_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChartBatch<B>>>> {
        let dataset = self
            .valid_dataset
            .clone()
            .ok_or_else(|| ChartError::Config("validation split is not set up".to_string()))?;

        Ok(DataLoaderBuilder::new(self.batcher::<B>(device))
            .batch_size(self.batch_size)
            .num_workers(self.num_workers)
            .build(dataset))
    }

    pub fn test_dataloader<B: Backend>(
        &self,
        device: B::Device,
    ) -> Result<Arc<dyn DataLoader<ChartBatch<B>>>> {
        self.val_dataloader(device)
    }
}
