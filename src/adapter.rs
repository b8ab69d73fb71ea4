//! Low-rank side paths for frozen linear layers.
//!
//! ```text
//! output = base(x) + up(down(x))
//! ```
//!
//! Where:
//! - `base` is the frozen pretrained [Linear] layer, `[d_input, d_output]`
//! - `down` projects to the adapter rank, `[d_input, rank]`
//! - `up` projects back to the output width, `[rank, d_output]`
//!
//! Both adapter layers start at exactly zero, so a freshly adapted layer computes the same
//! function as the pretrained one until the first optimizer step.

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::tensor::{Tensor, backend::Backend};

/// Configuration to create a [LowRankAdapter] using the [init function](LowRankAdapterConfig::init).
#[derive(Config, Debug)]
pub struct LowRankAdapterConfig {
    /// The size of the input features.
    pub d_input: usize,
    /// The size of the output features.
    pub d_output: usize,
    /// Inner dimension of the factorization.
    pub rank: usize,
}

/// Rank-limited correction `up(down(x))`, zero until trained.
#[derive(Module, Debug)]
pub struct LowRankAdapter<B: Backend> {
    /// Down-projection, `[d_input, rank]`.
    pub down: Linear<B>,
    /// Up-projection, `[rank, d_output]`.
    pub up: Linear<B>,
}

impl LowRankAdapterConfig {
    /// Initialize a new [adapter](LowRankAdapter) computing the zero function.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LowRankAdapter<B> {
        LowRankAdapter {
            down: LinearConfig::new(self.d_input, self.rank)
                .with_initializer(Initializer::Zeros)
                .init(device),
            up: LinearConfig::new(self.rank, self.d_output)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

impl<B: Backend> LowRankAdapter<B> {
    /// # Shapes
    ///
    /// - input: `[..., d_input]`
    /// - output: `[..., d_output]`
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        self.up.forward(self.down.forward(input))
    }

    /// The adapter as a dense update `(delta_weight, delta_bias)`.
    ///
    /// `x @ delta_weight + delta_bias == forward(x)` for any `x`.
    pub fn delta(&self) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let up_weight = self.up.weight.val();
        let [rank, d_output] = up_weight.dims();
        let device = up_weight.device();

        let delta_weight = self.down.weight.val().matmul(up_weight.clone());

        let down_bias = match &self.down.bias {
            Some(bias) => bias.val().reshape([1, rank]).matmul(up_weight).reshape([d_output]),
            None => Tensor::zeros([d_output], &device),
        };
        let delta_bias = match &self.up.bias {
            Some(bias) => down_bias + bias.val(),
            None => down_bias,
        };

        (delta_weight, delta_bias)
    }
}

/// Configuration to create an [AdaptedLinear] layer.
#[derive(Config, Debug)]
pub struct AdaptedLinearConfig {
    /// The size of the input features.
    pub d_input: usize,
    /// The size of the output features.
    pub d_output: usize,
    /// Rank of the adapter.
    pub rank: usize,
    /// Whether the frozen layer has a bias. Default: true
    #[config(default = true)]
    pub bias: bool,
}

/// Frozen [Linear] layer with a parallel [LowRankAdapter] over the same widths.
#[derive(Module, Debug)]
pub struct AdaptedLinear<B: Backend> {
    /// Pretrained projection, never updated by the optimizer.
    pub base: Linear<B>,
    /// Trainable correction.
    pub adapter: LowRankAdapter<B>,
}

impl AdaptedLinearConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AdaptedLinear<B> {
        AdaptedLinear {
            base: LinearConfig::new(self.d_input, self.d_output)
                .with_bias(self.bias)
                .init(device)
                .no_grad(),
            adapter: LowRankAdapterConfig::new(self.d_input, self.d_output, self.rank)
                .init(device),
        }
    }
}

impl<B: Backend> AdaptedLinear<B> {
    /// `base(x) + adapter(x)`.
    ///
    /// # Shapes
    ///
    /// - input: `[..., d_input]`
    /// - output: `[..., d_output]`
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        self.base.forward(input.clone()) + self.adapter.forward(input)
    }

    /// Fold the adapter into the frozen weights and restart it from zero.
    ///
    /// The layer computes the same function before and after. The adapter biases are folded
    /// into the base bias, so a base without bias gains one.
    pub fn merge(self) -> Self {
        let (delta_weight, delta_bias) = self.adapter.delta();
        let device = delta_weight.device();
        let [d_input, rank] = self.adapter.down.weight.val().dims();
        let [_, d_output] = delta_weight.dims();

        let weight = self.base.weight.val() + delta_weight;
        let bias = match &self.base.bias {
            Some(bias) => bias.val() + delta_bias,
            None => delta_bias,
        };

        let base = Linear {
            weight: Param::initialized(self.base.weight.id, weight.set_require_grad(false)),
            bias: Some(match self.base.bias {
                Some(param) => Param::initialized(param.id, bias.set_require_grad(false)),
                None => Param::from_tensor(bias.set_require_grad(false)),
            }),
        };

        Self {
            base,
            adapter: LowRankAdapterConfig::new(d_input, d_output, rank).init(&device),
        }
    }
}
