use burn::{
    config::Config,
    module::Module,
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        Data, Int, Shape, Tensor,
    },
    train::{metric::Adaptor, TrainOutput, TrainStep, ValidStep},
};

use crate::{
    dataset::ChartBatch,
    error::{self, ChartError},
    metric::{BenetechInput, ChartLossInput},
    parse_config::MAX_PATCH_POSITIONS,
};

use super::{
    decoder::text::{TextDecoder, TextDecoderConfig},
    encoder::patch::{PatchEncoder, PatchEncoderConfig},
};

/// Pretrained checkpoints the module knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreset {
    Deplot,
}

impl ModelPreset {
    pub fn from_model_path(model_path: &str) -> error::Result<Self> {
        match model_path {
            "google/deplot" => Ok(ModelPreset::Deplot),
            other => Err(ChartError::UnsupportedModel(other.to_string())),
        }
    }

    /// Architecture of the preset for the given vocabulary and patch size.
    pub fn config(&self, vocab_size: usize, patch_input_size: usize) -> Pix2StructConfig {
        match self {
            ModelPreset::Deplot => Pix2StructConfig::new(vocab_size, patch_input_size)
                .with_dimensions(768)
                .with_feed_forward_size(2048)
                .with_n_heads(12)
                .with_encoder_stacks(12)
                .with_decoder_stacks(12)
                .with_max_patch_positions(MAX_PATCH_POSITIONS),
        }
    }
}

#[derive(Config, Debug)]
pub struct Pix2StructConfig {
    vocab_size: usize,
    patch_input_size: usize,
    #[config(default = 768)]
    dimensions: usize,
    #[config(default = 2048)]
    feed_forward_size: usize,
    #[config(default = 12)]
    n_heads: usize,
    #[config(default = 12)]
    encoder_stacks: usize,
    #[config(default = 12)]
    decoder_stacks: usize,
    #[config(default = 0.1)]
    dropout: f64,
    #[config(default = 4096)]
    max_patch_positions: usize,
    #[config(default = 512)]
    max_new_tokens: usize,
    #[config(default = 0)]
    pad_token_id: usize,
    #[config(default = 1)]
    eos_token_id: usize,
}

impl Pix2StructConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Pix2Struct<B> {
        Pix2Struct {
            encoder: PatchEncoderConfig::new(self.patch_input_size, self.dimensions)
                .with_max_patch_positions(self.max_patch_positions)
                .with_feed_forward_size(self.feed_forward_size)
                .with_n_heads(self.n_heads)
                .with_stacks(self.encoder_stacks)
                .with_dropout(self.dropout)
                .init(device),
            decoder: TextDecoderConfig::new(self.vocab_size, self.dimensions)
                // generated rows hold the start token plus `max_new_tokens` ids
                .with_max_text_positions(self.max_new_tokens + 1)
                .with_feed_forward_size(self.feed_forward_size)
                .with_n_heads(self.n_heads)
                .with_stacks(self.decoder_stacks)
                .with_dropout(self.dropout)
                .init(device),
            pad_token_id: self.pad_token_id,
            eos_token_id: self.eos_token_id,
            max_new_tokens: self.max_new_tokens,
        }
    }
}

#[derive(Module, Debug)]
pub struct Pix2Struct<B: Backend> {
    pub encoder: PatchEncoder<B>,
    pub decoder: TextDecoder<B>,
    pad_token_id: usize,
    eos_token_id: usize,
    max_new_tokens: usize,
}

impl<B: Backend> Pix2Struct<B> {
    /// Labels shifted one step to the right, the PAD id acting as the
    /// decoder start token.
    fn shift_right(&self, labels: Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
        let [batch, length] = labels.dims();
        let start =
            Tensor::<B, 2, Int>::full([batch, 1], self.pad_token_id as i64, &labels.device());
        if length <= 1 {
            return start;
        }

        Tensor::cat(vec![start, labels.slice([0..batch, 0..(length - 1)])], 1)
    }

    /// Logits `[batch, length, vocab_size]` over the shifted labels and the
    /// cross-entropy loss, PAD targets ignored.
    pub fn forward_loss(
        &self,
        flattened_patches: Tensor<B, 3>,
        attention_mask: Tensor<B, 2>,
        labels: Tensor<B, 2, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 3>) {
        let device = &self.devices()[0];
        let flattened_patches = flattened_patches.to_device(device);
        let attention_mask = attention_mask.to_device(device);
        let labels = labels.to_device(device);

        let memory = self
            .encoder
            .forward(flattened_patches, attention_mask.clone());
        let logits = self.decoder.forward(
            self.shift_right(labels.clone()),
            memory,
            attention_mask.equal_elem(0.0),
        );

        let [batch, length, vocab_size] = logits.dims();
        let log_probs = log_softmax(logits.clone().reshape([batch * length, vocab_size]), 1);
        let targets = labels.reshape([batch * length, 1]);
        let keep = targets
            .clone()
            .equal_elem(self.pad_token_id as i64)
            .bool_not()
            .float()
            .reshape([batch * length]);
        let target_log_probs = log_probs.gather(1, targets).reshape([batch * length]);

        // mean over non-PAD targets only
        let count = keep.clone().sum().clamp_min(1.0);
        let loss = (target_log_probs * keep).sum().neg() / count;

        (loss, logits)
    }

    /// Greedy decoding of at most `max_new_tokens` ids per row. Stops once
    /// every row emitted EOS; positions after a row's EOS hold PAD.
    pub fn generate(
        &self,
        flattened_patches: Tensor<B, 3>,
        attention_mask: Tensor<B, 2>,
    ) -> Tensor<B, 2, Int> {
        let device = &self.devices()[0];
        let flattened_patches = flattened_patches.to_device(device);
        let attention_mask = attention_mask.to_device(device);
        let [batch, _, _] = flattened_patches.dims();

        let memory = self
            .encoder
            .forward(flattened_patches, attention_mask.clone());
        let memory_mask_pad = attention_mask.equal_elem(0.0);
        let mut cache = self.decoder.new_cache();
        let mut tokens = Tensor::<B, 2, Int>::full([batch, 1], self.pad_token_id as i64, device);
        let mut finished = vec![false; batch];

        for _ in 0..self.max_new_tokens {
            let logits = self.decoder.forward_cached(
                tokens.clone(),
                memory.clone(),
                memory_mask_pad.clone(),
                &mut cache,
            );
            let [_, length, vocab_size] = logits.dims();
            let next = logits
                .slice([0..batch, (length - 1)..length, 0..vocab_size])
                .argmax(2)
                .reshape([batch])
                .into_data()
                .convert::<i64>()
                .value;

            let next: Vec<i64> = next
                .into_iter()
                .zip(finished.iter_mut())
                .map(|(id, done)| {
                    if *done {
                        return self.pad_token_id as i64;
                    }
                    *done = id == self.eos_token_id as i64;
                    id
                })
                .collect();
            let next = Tensor::<B, 1, Int>::from_data(
                Data::new(next, Shape::new([batch])).convert(),
                device,
            )
            .reshape([batch, 1]);
            tokens = Tensor::cat(vec![tokens, next], 1);

            if finished.iter().all(|&done| done) {
                break;
            }
        }

        let [_, length] = tokens.dims();
        tokens.slice([0..batch, 1..length])
    }

    pub fn forward_step(&self, batch: ChartBatch<B>, generate: bool) -> ChartOutput<B> {
        let batch_size = batch.texts.len();
        let (loss, _) = self.forward_loss(
            batch.flattened_patches.clone(),
            batch.attention_mask.clone(),
            batch.labels,
        );
        let predictions = match generate {
            true => Some(self.generate(batch.flattened_patches, batch.attention_mask)),
            false => None,
        };

        ChartOutput {
            loss,
            batch_size,
            predictions,
            texts: batch.texts,
        }
    }
}

/// Rows of an Int tensor as token ids.
pub fn to_token_ids<B: Backend>(tokens: Tensor<B, 2, Int>) -> Vec<Vec<u32>> {
    let [batch, length] = tokens.dims();
    if length == 0 {
        return vec![Vec::new(); batch];
    }

    tokens
        .into_data()
        .convert::<i64>()
        .value
        .chunks(length)
        .map(|row| row.iter().map(|&id| id as u32).collect())
        .collect()
}

/// Output of a train or valid step. Only valid steps generate text.
#[derive(Debug, Clone)]
pub struct ChartOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub batch_size: usize,
    pub predictions: Option<Tensor<B, 2, Int>>,
    pub texts: Vec<String>,
}

impl<B: Backend> Adaptor<ChartLossInput<B>> for ChartOutput<B> {
    fn adapt(&self) -> ChartLossInput<B> {
        ChartLossInput {
            loss: self.loss.clone(),
            batch_size: self.batch_size,
        }
    }
}

impl<B: Backend> Adaptor<BenetechInput> for ChartOutput<B> {
    fn adapt(&self) -> BenetechInput {
        let predicted_ids = match &self.predictions {
            Some(predictions) => to_token_ids(predictions.clone()),
            None => Vec::new(),
        };
        let ground_truths = match self.predictions {
            Some(_) => self.texts.clone(),
            None => Vec::new(),
        };

        BenetechInput {
            ground_truths,
            predicted_ids,
        }
    }
}

impl<B: AutodiffBackend> TrainStep<ChartBatch<B>, ChartOutput<B>> for Pix2Struct<B> {
    fn step(&self, batch: ChartBatch<B>) -> TrainOutput<ChartOutput<B>> {
        let item = self.forward_step(batch, false);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ChartBatch<B>, ChartOutput<B>> for Pix2Struct<B> {
    fn step(&self, batch: ChartBatch<B>) -> ChartOutput<B> {
        self.forward_step(batch, true)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    type TestBackend = NdArray;

    pub(crate) fn tiny_config(vocab_size: usize, patch_input_size: usize) -> Pix2StructConfig {
        Pix2StructConfig::new(vocab_size, patch_input_size)
            .with_dimensions(16)
            .with_feed_forward_size(32)
            .with_n_heads(2)
            .with_encoder_stacks(1)
            .with_decoder_stacks(1)
            .with_dropout(0.0)
            .with_max_patch_positions(16)
            .with_max_new_tokens(6)
    }

    fn inputs(
        device: &NdArrayDevice,
    ) -> (
        Tensor<TestBackend, 3>,
        Tensor<TestBackend, 2>,
        Tensor<TestBackend, 2, Int>,
    ) {
        let ids = Tensor::<TestBackend, 3>::ones([2, 4, 2], device);
        let pixels = Tensor::<TestBackend, 3>::random(
            [2, 4, 12],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let patches = Tensor::cat(vec![ids, pixels], 2);
        let mask = Tensor::<TestBackend, 2>::from_data(
            Data::<f32, 2>::from([[1.0, 1.0, 1.0, 0.0], [1.0, 1.0, 0.0, 0.0]]).convert(),
            device,
        );
        let labels = Tensor::<TestBackend, 2, Int>::from_data(
            Data::<i64, 2>::from([[5, 6, 7, 1], [8, 1, 0, 0]]).convert(),
            device,
        );

        (patches, mask, labels)
    }

    #[test]
    fn test_unsupported_model() {
        let res = ModelPreset::from_model_path("google/pix2struct-base");

        assert!(matches!(res, Err(ChartError::UnsupportedModel(name)) if name == "google/pix2struct-base"));
        assert_eq!(
            ModelPreset::from_model_path("google/deplot").unwrap(),
            ModelPreset::Deplot
        );
    }

    #[test]
    fn test_shift_right() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let labels = Tensor::<TestBackend, 2, Int>::from_data(
            Data::<i64, 2>::from([[5, 6, 1], [7, 1, 0]]).convert(),
            &device,
        );

        let shifted = to_token_ids(model.shift_right(labels));
        assert_eq!(shifted, vec![vec![0, 5, 6], vec![0, 7, 1]]);
    }

    #[test]
    fn test_forward_loss() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let (patches, mask, labels) = inputs(&device);

        let (loss, logits) = model.forward_loss(patches, mask, labels);
        assert_eq!(logits.dims(), [2, 4, 10]);
        let loss = loss.into_data().convert::<f64>().value[0];
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_loss_ignores_trailing_pad() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let (patches, mask, _) = inputs(&device);
        let patches = patches.slice([0..1, 0..4, 0..14]);
        let mask = mask.slice([0..1, 0..4]);
        let loss = |labels: Data<i64, 2>| {
            let labels = Tensor::<TestBackend, 2, Int>::from_data(labels.convert(), &device);
            let (loss, _) = model.forward_loss(patches.clone(), mask.clone(), labels);
            loss.into_data().convert::<f64>().value[0]
        };

        let unpadded = loss(Data::from([[5, 6, 1]]));
        let padded = loss(Data::from([[5, 6, 1, 0, 0, 0]]));
        assert!((unpadded - padded).abs() < 1e-5, "{unpadded} != {padded}");
    }

    #[test]
    fn test_preset_patch_positions_match_validation() {
        let config = ModelPreset::Deplot.config(10, 768);

        assert_eq!(config.max_patch_positions, MAX_PATCH_POSITIONS);
        assert_eq!(config.patch_input_size, 768);
    }

    #[test]
    fn test_fixed_seed_gives_identical_loss() {
        let device = NdArrayDevice::Cpu;
        let run = || {
            <TestBackend as Backend>::seed(0);
            let model = tiny_config(10, 12).init::<TestBackend>(&device);
            let (patches, mask, labels) = inputs(&device);
            let (loss, _) = model.forward_loss(patches, mask, labels);
            loss.into_data().convert::<f64>().value[0]
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_generate_is_bounded() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let (patches, mask, _) = inputs(&device);

        let generated = to_token_ids(model.generate(patches, mask));
        assert_eq!(generated.len(), 2);
        for row in generated {
            assert!(!row.is_empty() && row.len() <= 6);
            assert!(row.iter().all(|&id| id < 10));
            if let Some(eos) = row.iter().position(|&id| id == 1) {
                assert!(row[eos + 1..].iter().all(|&id| id == 0));
            }
        }
    }

    #[test]
    fn test_valid_step_generates() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let (flattened_patches, attention_mask, labels) = inputs(&device);
        let batch = ChartBatch {
            flattened_patches,
            attention_mask,
            labels,
            texts: vec!["line".to_string(), "bar".to_string()],
        };

        let output = ValidStep::step(&model, batch);
        let input: BenetechInput = output.adapt();
        assert_eq!(input.ground_truths.len(), 2);
        assert_eq!(input.predicted_ids.len(), 2);
        let loss: ChartLossInput<TestBackend> = output.adapt();
        assert_eq!(loss.batch_size, 2);
    }

    #[test]
    fn test_train_output_skips_scoring() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config(10, 12).init::<TestBackend>(&device);
        let (flattened_patches, attention_mask, labels) = inputs(&device);
        let batch = ChartBatch {
            flattened_patches,
            attention_mask,
            labels,
            texts: vec!["line".to_string(), "bar".to_string()],
        };

        let output = model.forward_step(batch, false);
        let input: BenetechInput = output.adapt();
        assert!(output.predictions.is_none());
        assert!(input.ground_truths.is_empty());
    }
}
