use burn::config::Config;
use burn::module::{Module, Param};
use burn::tensor::{Tensor, backend::Backend};

/// Configuration to create a [LayerNorm] layer using the [init function](LayerNormConfig::init).
#[derive(Config, Debug)]
pub struct LayerNormConfig {
    /// The size of the input features.
    pub d_model: usize,
    /// Whether the layer has a learned bias. Default: true
    #[config(default = true)]
    pub bias: bool,
    /// A value required for numerical stability. Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

/// Layer normalization with an optional bias, as used by GPT-2.
///
/// `Y = (X - mean) / sqrt(var + epsilon) * weight + bias`
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    pub weight: Param<Tensor<B, 1>>,
    pub bias: Option<Param<Tensor<B, 1>>>,
    epsilon: f64,
}

impl LayerNormConfig {
    /// Initialize a new [layer norm](LayerNorm) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LayerNorm<B> {
        let weight = Param::from_tensor(Tensor::ones([self.d_model], device));
        let bias = self
            .bias
            .then(|| Param::from_tensor(Tensor::zeros([self.d_model], device)));

        LayerNorm {
            weight,
            bias,
            epsilon: self.epsilon,
        }
    }
}

impl<B: Backend> LayerNorm<B> {
    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[..., any, d_model]`
    /// - output: `[..., any, d_model]`
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let (var, mean) = input.clone().var_mean_bias(D - 1);

        let normalized = input
            .sub(mean)
            .div(var.add_scalar(self.epsilon).sqrt())
            .mul(self.weight.val().unsqueeze());

        match &self.bias {
            Some(bias) => normalized.add(bias.val().unsqueeze()),
            None => normalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{TestBackend, assert_close};

    #[test]
    fn layer_norm_forward() {
        let device = Default::default();
        let module = LayerNormConfig::new(4).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::from_data([[1.0, 2.0, 3.0, 4.0]], &device);

        let output = module.forward(input);

        // mean 2.5, biased variance 1.25
        let scale = 1.0 / (1.25f32 + 1e-5).sqrt();
        assert_close(
            output,
            [[-1.5 * scale, -0.5 * scale, 0.5 * scale, 1.5 * scale]],
            1e-5,
        );
    }

    #[test]
    fn layer_norm_without_bias_has_no_bias_param() {
        let device = Default::default();
        let module = LayerNormConfig::new(4)
            .with_bias(false)
            .init::<TestBackend>(&device);

        assert!(module.bias.is_none());
        assert_eq!(module.num_params(), 4);
    }
}
