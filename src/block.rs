use burn::config::Config;
use burn::module::Module;
use burn::tensor::{Tensor, backend::Backend};

use crate::attention::{AdaptedAttention, AdaptedAttentionConfig};
use crate::error;
use crate::feedforward::{AdaptedFeedForward, AdaptedFeedForwardConfig};
use crate::norm::{LayerNorm, LayerNormConfig};

/// Configuration to create an [adapted block](AdaptedBlock) using the [init function](AdaptedBlockConfig::init).
#[derive(Config, Debug)]
pub struct AdaptedBlockConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub block_size: usize,
    pub rank: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = true)]
    pub bias: bool,
    #[config(default = 64)]
    pub tile_size: usize,
}

/// Pre-norm transformer block.
///
/// ```text
/// x = x + attn(norm_attn(x))
/// x = x + ffn(norm_ffn(x))
/// ```
#[derive(Module, Debug)]
pub struct AdaptedBlock<B: Backend> {
    pub norm_attn: LayerNorm<B>,
    pub attn: AdaptedAttention<B>,
    pub norm_ffn: LayerNorm<B>,
    pub ffn: AdaptedFeedForward<B>,
}

impl AdaptedBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<AdaptedBlock<B>> {
        let norm = LayerNormConfig::new(self.d_model).with_bias(self.bias);

        let attn = AdaptedAttentionConfig::new(self.d_model, self.n_heads, self.block_size, self.rank)
            .with_dropout(self.dropout)
            .with_bias(self.bias)
            .with_tile_size(self.tile_size)
            .init(device)?;
        let ffn = AdaptedFeedForwardConfig::new(self.d_model, self.rank)
            .with_dropout(self.dropout)
            .with_bias(self.bias)
            .init(device);

        Ok(AdaptedBlock {
            norm_attn: norm.init(device),
            attn,
            norm_ffn: norm.init(device),
            ffn,
        })
    }
}

impl<B: Backend> AdaptedBlock<B> {
    /// # Shapes
    ///
    /// - input: `[batch_size, seq_length, d_model]`
    /// - output: `[batch_size, seq_length, d_model]`
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = input.clone() + self.attn.forward(self.norm_attn.forward(input));
        x.clone() + self.ffn.forward(self.norm_ffn.forward(x))
    }

    /// Fold the four adapters into their frozen layers.
    pub fn merge_adapters(mut self) -> Self {
        self.attn.qkv = self.attn.qkv.merge();
        self.attn.proj = self.attn.proj.merge();
        self.ffn.expand = self.ffn.expand.merge();
        self.ffn.contract = self.ffn.contract.merge();
        self
    }
}
