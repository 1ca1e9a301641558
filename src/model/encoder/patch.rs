use burn::{
    config::Config,
    module::Module,
    nn::{
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig,
    },
    tensor::{backend::Backend, Tensor},
};

/// Vision half of the model. Consumes flattened patches whose first two
/// values are the row and column ids of the patch.
#[derive(Module, Debug)]
pub struct PatchEncoder<B: Backend> {
    pub patch_projection: Linear<B>,
    pub row_embedding: Embedding<B>,
    pub column_embedding: Embedding<B>,
    dropout: Dropout,
    pub transformer: TransformerEncoder<B>,
    pub layernorm: LayerNorm<B>,
}

impl<B: Backend> PatchEncoder<B> {
    /// # Shapes
    ///
    /// - flattened_patches: `[batch, max_patches, 2 + patch_input_size]`
    /// - attention_mask: `[batch, max_patches]`, `1.0` for real patches
    /// - output: `[batch, max_patches, dimensions]`
    pub fn forward(
        &self,
        flattened_patches: Tensor<B, 3>,
        attention_mask: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let [batch, patches, depth] = flattened_patches.dims();
        let row_ids = flattened_patches
            .clone()
            .slice([0..batch, 0..patches, 0..1])
            .reshape([batch, patches])
            .int();
        let column_ids = flattened_patches
            .clone()
            .slice([0..batch, 0..patches, 1..2])
            .reshape([batch, patches])
            .int();
        let pixels = flattened_patches.slice([0..batch, 0..patches, 2..depth]);

        let embedded = self.patch_projection.forward(pixels)
            + self.row_embedding.forward(row_ids)
            + self.column_embedding.forward(column_ids);
        let embedded = self.dropout.forward(embedded);

        let input = TransformerEncoderInput::new(embedded).mask_pad(attention_mask.equal_elem(0.0));
        let encoded = self.transformer.forward(input);

        self.layernorm.forward(encoded)
    }
}

#[derive(Config, Debug)]
pub struct PatchEncoderConfig {
    patch_input_size: usize,
    dimensions: usize,
    #[config(default = "4096")]
    max_patch_positions: usize,
    #[config(default = "2048")]
    feed_forward_size: usize,
    #[config(default = "12")]
    n_heads: usize,
    #[config(default = "12")]
    stacks: usize,
    #[config(default = "0.1")]
    dropout: f64,
}

impl PatchEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchEncoder<B> {
        let embedding = || EmbeddingConfig::new(self.max_patch_positions, self.dimensions).init(device);

        PatchEncoder {
            patch_projection: LinearConfig::new(self.patch_input_size, self.dimensions).init(device),
            row_embedding: embedding(),
            column_embedding: embedding(),
            dropout: DropoutConfig::new(self.dropout).init(),
            transformer: TransformerEncoderConfig::new(
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
        }
    }
}

#[cfg(test)]
mod test {
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    use super::*;

    #[test]
    fn test_patch_encoder() {
        let device = NdArrayDevice::Cpu;
        let encoder = PatchEncoderConfig::new(12, 16)
            .with_max_patch_positions(8)
            .with_feed_forward_size(32)
            .with_n_heads(2)
            .with_stacks(1)
            .init::<NdArray>(&device);

        let ids = Tensor::<NdArray, 3>::ones([2, 4, 2], &device);
        let pixels = Tensor::<NdArray, 3>::random(
            [2, 4, 12],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let patches = Tensor::cat(vec![ids, pixels], 2);
        let mask = Tensor::<NdArray, 2>::ones([2, 4], &device);

        let res = encoder.forward(patches, mask);
        assert_eq!(res.dims(), [2, 4, 16]);
    }
}
