use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChartError, Result},
    image_data::PatchExtractor,
    utils::text_processor::TextProcessor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
        }
    }
}

#[derive(Clone)]
pub struct ChartBatcher<B: Backend> {
    device: B::Device,
    processor: TextProcessor,
    max_length: usize,
}

impl<B: Backend> ChartBatcher<B> {
    pub fn new(device: B::Device, processor: TextProcessor, max_length: usize) -> Self {
        Self {
            device,
            processor,
            max_length,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChartBatch<B: Backend> {
    pub flattened_patches: Tensor<B, 3>,
    pub attention_mask: Tensor<B, 2>,
    pub labels: Tensor<B, 2, Int>,
    pub texts: Vec<String>,
}

impl<B: Backend> Batcher<EncodedSample, ChartBatch<B>> for ChartBatcher<B> {
    fn batch(&self, items: Vec<EncodedSample>) -> ChartBatch<B> {
        let batch_size = items.len();
        let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();
        let data_labels = self
            .processor
            .encode_to_tensor_data(&texts, self.max_length)
            .unwrap_or_else(|err| panic!("failed to tokenize batch labels: {err}"));
        let labels = Tensor::<B, 2, Int>::from_data(data_labels.convert(), &self.device);

        let mut patches = Vec::with_capacity(batch_size);
        let mut masks = Vec::with_capacity(batch_size);
        for item in items {
            let data_patches = Data::new(
                item.flattened_patches,
                Shape::new([1, item.max_patches, item.patch_dim]),
            );
            let data_mask = Data::new(item.attention_mask, Shape::new([1, item.max_patches]));

            patches.push(Tensor::<B, 3>::from_data(data_patches.convert(), &self.device));
            masks.push(Tensor::<B, 2>::from_data(data_mask.convert(), &self.device));
        }

        ChartBatch {
            flattened_patches: Tensor::cat(patches, 0),
            attention_mask: Tensor::cat(masks, 0),
            labels,
            texts,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EncodedSample {
    pub flattened_patches: Vec<f32>,
    pub attention_mask: Vec<f32>,
    pub max_patches: usize,
    pub patch_dim: usize,
    pub text: String,
}

#[derive(Deserialize, Debug)]
struct MetadataRow {
    file_name: String,
    text: String,
}

/// One split of an imagefolder dataset. `metadata.jsonl` in the split
/// directory lists every image with its target text; images are decoded
/// only when an item is requested.
#[derive(Clone, Debug)]
pub struct ChartImgDataset {
    path_and_label: Vec<(PathBuf, String)>,
    extractor: PatchExtractor,
}

impl ChartImgDataset {
    pub fn from_image_folder<P: AsRef<Path>>(
        data_dir: P,
        split: Split,
        extractor: PatchExtractor,
    ) -> Result<Self> {
        let split_dir = data_dir.as_ref().join(split.dir_name());
        let metadata_path = split_dir.join("metadata.jsonl");
        let data = fs::read_to_string(&metadata_path)?;

        let path_and_label = data
            .lines()
            .enumerate()
            .filter(|(_, row)| !row.trim().is_empty())
            .map(|(idx, row)| {
                let row: MetadataRow =
                    serde_json::from_str(row).map_err(|err| ChartError::MalformedSplit {
                        path: metadata_path.clone(),
                        line: idx + 1,
                        reason: err.to_string(),
                    })?;

                Ok((split_dir.join(row.file_name), row.text))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            "loaded {} samples from {}",
            path_and_label.len(),
            split_dir.display()
        );

        Ok(Self {
            path_and_label,
            extractor,
        })
    }

    /// Keeps the first `len` samples.
    pub fn truncated(mut self, len: usize) -> Self {
        self.path_and_label.truncate(len);
        self
    }

    pub fn encode(&self, index: usize) -> Result<EncodedSample> {
        let (path, text) = &self.path_and_label[index];
        let encoded = self.extractor.open(path)?;

        Ok(EncodedSample {
            flattened_patches: encoded.patches,
            attention_mask: encoded.attention_mask,
            max_patches: encoded.max_patches,
            patch_dim: encoded.patch_dim,
            text: text.clone(),
        })
    }
}

impl Dataset<EncodedSample> for ChartImgDataset {
    fn get(&self, index: usize) -> Option<EncodedSample> {
        if index >= self.len() {
            return None;
        }

        match self.encode(index) {
            Ok(sample) => Some(sample),
            Err(err) => panic!(
                "failed to load {}: {err}",
                self.path_and_label[index].0.display()
            ),
        }
    }

    fn len(&self) -> usize {
        self.path_and_label.len()
    }
}
