use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig};
use burn::tensor::{Tensor, backend::Backend};

use crate::adapter::{AdaptedLinear, AdaptedLinearConfig};
use crate::error::{self, LoraError};
use crate::kernel::AttentionKernel;

/// Configuration to create an [AdaptedAttention] layer using the [init function](AdaptedAttentionConfig::init).
#[derive(Config, Debug)]
pub struct AdaptedAttentionConfig {
    /// The size of each token representation.
    pub d_model: usize,
    /// The number of attention heads.
    pub n_heads: usize,
    /// Maximum sequence length.
    pub block_size: usize,
    /// Rank of the adapters on both projections.
    pub rank: usize,
    /// Dropout on attention weights and on the output. Default: 0.0
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Whether the frozen projections have a bias. Default: true
    #[config(default = true)]
    pub bias: bool,
    /// Key tile width of the streaming kernel, 0 always uses the explicit kernel. Default: 64
    #[config(default = 64)]
    pub tile_size: usize,
}

/// Causal multi-head self-attention with adapted projections.
///
/// # Params
///
/// - qkv: fused query/key/value projection, `d_model` to `3 * d_model`.
/// - proj: output projection, `d_model` to `d_model`.
#[derive(Module, Debug)]
pub struct AdaptedAttention<B: Backend> {
    pub qkv: AdaptedLinear<B>,
    pub proj: AdaptedLinear<B>,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_heads: usize,
    block_size: usize,
    tile_size: usize,
}

impl AdaptedAttentionConfig {
    /// Initialize a new [adapted attention](AdaptedAttention) module.
    ///
    /// Fails when `d_model` is not a multiple of `n_heads`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<AdaptedAttention<B>> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(LoraError::Configuration(format!(
                "embedding width {} is not divisible by the head count {}",
                self.d_model, self.n_heads
            )));
        }

        let projection = |d_output| {
            AdaptedLinearConfig::new(self.d_model, d_output, self.rank)
                .with_bias(self.bias)
                .init(device)
        };

        Ok(AdaptedAttention {
            qkv: projection(3 * self.d_model),
            proj: projection(self.d_model),
            attn_dropout: DropoutConfig::new(self.dropout).init(),
            resid_dropout: DropoutConfig::new(self.dropout).init(),
            n_heads: self.n_heads,
            block_size: self.block_size,
            tile_size: self.tile_size,
        })
    }
}

impl<B: Backend> AdaptedAttention<B> {
    /// # Shapes
    ///
    /// - input: `[batch_size, seq_length, d_model]`
    /// - output: `[batch_size, seq_length, d_model]`
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let kernel = AttentionKernel::select(input.dims()[1], self.tile_size);
        self.forward_with(input, kernel)
    }

    /// Same as [forward](AdaptedAttention::forward) with a given kernel.
    pub fn forward_with(&self, input: Tensor<B, 3>, kernel: AttentionKernel) -> Tensor<B, 3> {
        let [batch_size, seq_length, d_model] = input.dims();
        debug_assert!(seq_length <= self.block_size);

        let qkv = self.qkv.forward(input);
        let [query, key, value] =
            [0, 1, 2].map(|index| self.split_heads(qkv.clone().narrow(2, index * d_model, d_model)));

        let context = kernel.forward(query, key, value, &self.attn_dropout);
        let context = context
            .swap_dims(1, 2)
            .reshape([batch_size, seq_length, d_model]);

        self.resid_dropout.forward(self.proj.forward(context))
    }

    /// `[batch, seq, d_model]` to `[batch, n_heads, seq, d_head]`.
    fn split_heads(&self, tensor: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch_size, seq_length, d_model] = tensor.dims();

        tensor
            .reshape([batch_size, seq_length, self.n_heads, d_model / self.n_heads])
            .swap_dims(1, 2)
    }
}
