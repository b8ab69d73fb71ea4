use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Gelu};
use burn::tensor::{Tensor, backend::Backend};

use crate::adapter::{AdaptedLinear, AdaptedLinearConfig};

/// Configuration to create an [adapted feed-forward](AdaptedFeedForward) layer using the [init function](AdaptedFeedForwardConfig::init).
#[derive(Config, Debug)]
pub struct AdaptedFeedForwardConfig {
    /// The size of the input and output features.
    pub d_model: usize,
    /// Rank of the adapters on both layers.
    pub rank: usize,
    /// The dropout rate on the output. Default: 0.0
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Whether the frozen layers have a bias. Default: true
    #[config(default = true)]
    pub bias: bool,
}

/// GPT-2 feed-forward network with a low-rank adapter beside each layer.
///
/// # Params
///
/// - expand: `d_model` to `4 * d_model`.
/// - contract: `4 * d_model` to `d_model`.
///
/// `FFN(x) = contract(gelu(expand(x)))`, each adapter reads the same input as its frozen layer.
#[derive(Module, Debug)]
pub struct AdaptedFeedForward<B: Backend> {
    pub expand: AdaptedLinear<B>,
    pub contract: AdaptedLinear<B>,
    gelu: Gelu,
    dropout: Dropout,
}

impl AdaptedFeedForwardConfig {
    /// Initialize a new [adapted feed-forward](AdaptedFeedForward) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> AdaptedFeedForward<B> {
        let d_hidden = 4 * self.d_model;

        AdaptedFeedForward {
            expand: AdaptedLinearConfig::new(self.d_model, d_hidden, self.rank)
                .with_bias(self.bias)
                .init(device),
            contract: AdaptedLinearConfig::new(d_hidden, self.d_model, self.rank)
                .with_bias(self.bias)
                .init(device),
            gelu: Gelu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> AdaptedFeedForward<B> {
    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, seq_length, d_model]`
    /// - output: `[batch_size, seq_length, d_model]`
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.expand.forward(input);
        let x = self.gelu.forward(x);
        let x = self.contract.forward(x);

        self.dropout.forward(x)
    }
}
