//! Low-rank adaptation of a frozen GPT-2 backbone for two-way sequence classification.
//!
//! Every linear projection of the attention and feed-forward layers is paired with a
//! zero-initialized [LowRankAdapter]; the pretrained weights stay frozen and only the
//! adapters and the classification head are trained.
//!
//! ```rust, ignore
//! let config = PretrainedVariant::Gpt2.config(8);
//! let weights = PretrainedWeights::from_safetensors("model.safetensors")?;
//! let model = config.init_pretrained::<B>(&weights, CheckpointConvention::Conv1d, &device)?;
//!
//! let logits = model.forward(tokens, Some(mask))?;
//! model.save_trainable("adapters.safetensors")?;
//! ```

pub mod adapter;
pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feedforward;
pub mod import;
pub mod kernel;
pub mod model;
pub mod norm;
pub mod param;
pub mod sampling;

pub use adapter::{AdaptedLinear, AdaptedLinearConfig, LowRankAdapter, LowRankAdapterConfig};
pub use attention::{AdaptedAttention, AdaptedAttentionConfig};
pub use block::{AdaptedBlock, AdaptedBlockConfig};
pub use config::{AdaptedClassifierConfig, GenerationConfig, PretrainedVariant};
pub use error::{LoraError, Result};
pub use feedforward::{AdaptedFeedForward, AdaptedFeedForwardConfig};
pub use import::{CheckpointConvention, PretrainedWeights, WeightMap, WeightMapping};
pub use kernel::AttentionKernel;
pub use model::AdaptedClassifier;
pub use param::{
    ApplyIssue, ApplyReport, HostTensor, ParamEntry, ParamRegistry, ParamRole, ParamSummary,
    RoleRules,
};

#[cfg(test)]
pub(crate) mod tests {
    use burn::tensor::{Tensor, TensorData, backend::Backend};

    pub type TestBackend = burn::backend::NdArray<f32>;

    pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    /// Element-wise comparison with an absolute tolerance.
    pub fn assert_close<B: Backend, const D: usize>(
        tensor: Tensor<B, D>,
        expected: impl Into<TensorData>,
        tolerance: f32,
    ) {
        let expected: TensorData = expected.into();
        let expected = expected.iter::<f32>().collect::<Vec<_>>();
        let actual = to_vec(tensor);

        assert_eq!(actual.len(), expected.len(), "element count differs");
        for (index, (a, e)) in actual.iter().zip(&expected).enumerate() {
            assert!(
                (a - e).abs() <= tolerance,
                "element {index}: {a} differs from {e} by more than {tolerance}"
            );
        }
    }
}
