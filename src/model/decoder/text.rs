use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::generate_autoregressive_mask,
        transformer::{
            TransformerDecoder, TransformerDecoderAutoregressiveCache, TransformerDecoderConfig,
            TransformerDecoderInput,
        },
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig,
    },
    tensor::{backend::Backend, Bool, Int, Tensor},
};

#[derive(Module, Debug)]
pub struct TextDecoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub position: Embedding<B>,
    dropout: Dropout,
    pub transformer: TransformerDecoder<B>,
    pub layernorm: LayerNorm<B>,
    pub generator: Linear<B>,
}

impl<B: Backend> TextDecoder<B> {
    fn embed(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, length] = tokens.dims();
        let device = tokens.device();
        let positions = Tensor::<B, 1, Int>::arange(0..length as i64, &device)
            .reshape([1, length])
            .repeat(0, batch);

        let embedded = self.embedding.forward(tokens) + self.position.forward(positions);
        self.dropout.forward(embedded)
    }

    fn input(
        &self,
        tokens: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        memory_mask_pad: Tensor<B, 2, Bool>,
    ) -> TransformerDecoderInput<B> {
        let [batch, length] = tokens.dims();
        let mask_attn = generate_autoregressive_mask::<B>(batch, length, &tokens.device());

        TransformerDecoderInput::new(self.embed(tokens), memory)
            .target_mask_attn(mask_attn)
            .memory_mask_pad(memory_mask_pad)
    }

    /// Returns logits of shape `[batch, length, vocab_size]`.
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        memory_mask_pad: Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let output = self
            .transformer
            .forward(self.input(tokens, memory, memory_mask_pad));

        self.generator.forward(self.layernorm.forward(output))
    }

    pub fn new_cache(&self) -> TransformerDecoderAutoregressiveCache<B> {
        self.transformer.new_autoregressive_cache()
    }

    /// Same as [forward](TextDecoder::forward) but reuses the projections of
    /// the previous decoding steps kept in `cache`.
    pub fn forward_cached(
        &self,
        tokens: Tensor<B, 2, Int>,
        memory: Tensor<B, 3>,
        memory_mask_pad: Tensor<B, 2, Bool>,
        cache: &mut TransformerDecoderAutoregressiveCache<B>,
    ) -> Tensor<B, 3> {
        let output = self
            .transformer
            .forward_autoregressive_inference(self.input(tokens, memory, memory_mask_pad), cache);

        self.generator.forward(self.layernorm.forward(output))
    }
}

#[derive(Config, Debug)]
pub struct TextDecoderConfig {
    vocab_size: usize,
    dimensions: usize,
    #[config(default = "1024")]
    max_text_positions: usize,
    #[config(default = "2048")]
    feed_forward_size: usize,
    #[config(default = "12")]
    n_heads: usize,
    #[config(default = "12")]
    stacks: usize,
    #[config(default = "0.1")]
    dropout: f64,
}

impl TextDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TextDecoder<B> {
        TextDecoder {
            embedding: EmbeddingConfig::new(self.vocab_size, self.dimensions).init(device),
            position: EmbeddingConfig::new(self.max_text_positions, self.dimensions).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            transformer: TransformerDecoderConfig::new(
                self.dimensions,
                self.feed_forward_size,
                self.n_heads,
                self.stacks,
            )
            .with_dropout(self.dropout)
            .with_norm_first(true)
            .init(device),
            layernorm: LayerNormConfig::new(self.dimensions)
                .with_epsilon(1e-6)
                .init(device),
            generator: LinearConfig::new(self.dimensions, self.vocab_size).init(device),
        }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    #[test]
    fn test_cached_forward_matches_full_forward() {
        let device = NdArrayDevice::Cpu;
        let decoder = TextDecoderConfig::new(10, 16)
            .with_max_text_positions(8)
            .with_feed_forward_size(32)
            .with_n_heads(2)
            .with_stacks(2)
            .with_dropout(0.0)
            .init::<NdArray>(&device);

        let memory = Tensor::<NdArray, 3>::random(
            [2, 3, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let memory_mask_pad = Tensor::<NdArray, 2>::zeros([2, 3], &device).equal_elem(1.0);
        let tokens = Tensor::<NdArray, 1, Int>::arange(0..8, &device).reshape([2, 4]);

        let full = decoder.forward(tokens.clone(), memory.clone(), memory_mask_pad.clone());
        assert_eq!(full.dims(), [2, 4, 10]);

        let mut cache = decoder.new_cache();
        let mut last = None;
        for length in 1..=4 {
            let prefix = tokens.clone().slice([0..2, 0..length]);
            last = Some(decoder.forward_cached(
                prefix,
                memory.clone(),
                memory_mask_pad.clone(),
                &mut cache,
            ));
        }
        let cached = last.unwrap();

        full.into_data().assert_approx_eq(&cached.into_data(), 3);
    }
}
