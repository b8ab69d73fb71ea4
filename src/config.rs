use core::fmt;
use core::str::FromStr;

use burn::config::Config;

use crate::error::{self, LoraError};

/// Architecture and fine-tuning settings of an [AdaptedClassifier](crate::AdaptedClassifier).
#[derive(Config, Debug)]
pub struct AdaptedClassifierConfig {
    /// Number of transformer blocks.
    pub n_layer: usize,
    /// Number of attention heads per block.
    pub n_head: usize,
    /// Embedding width.
    pub d_model: usize,
    /// Maximum sequence length.
    pub block_size: usize,
    /// Token vocabulary size.
    pub vocab_size: usize,
    /// Rank of every low-rank adapter.
    pub rank: usize,
    /// Dropout rate on embeddings, attention weights and residual paths. Default: 0.0
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Whether the frozen linear and normalization layers have a bias. Default: true
    #[config(default = true)]
    pub bias: bool,
    /// Also fine-tune the layer norm parameters. Default: false
    #[config(default = false)]
    pub train_layer_norms: bool,
    /// Key tile width above which attention streams over tiles, 0 disables it. Default: 64
    #[config(default = 64)]
    pub attention_tile: usize,
}

impl AdaptedClassifierConfig {
    /// Check that the architecture can be built.
    pub fn validate(&self) -> error::Result<()> {
        let checks = [
            (self.n_layer == 0, "at least one layer is required".to_string()),
            (self.n_head == 0, "at least one attention head is required".to_string()),
            (self.rank == 0, "adapter rank must be at least 1".to_string()),
            (self.block_size == 0, "block size must be at least 1".to_string()),
            (self.vocab_size == 0, "vocabulary cannot be empty".to_string()),
            (
                self.n_head != 0 && self.d_model % self.n_head != 0,
                format!(
                    "embedding width {} is not divisible by the head count {}",
                    self.d_model, self.n_head
                ),
            ),
            (
                !(0.0..1.0).contains(&self.dropout),
                format!("dropout {} is outside [0, 1)", self.dropout),
            ),
        ];

        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(LoraError::Configuration(reason)),
            None => Ok(()),
        }
    }
}

/// Published GPT-2 checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PretrainedVariant {
    /// 124M parameters.
    Gpt2,
    /// 350M parameters.
    Gpt2Medium,
    /// 774M parameters.
    Gpt2Large,
    /// 1558M parameters.
    Gpt2Xl,
}

impl PretrainedVariant {
    pub const ALL: [Self; 4] = [Self::Gpt2, Self::Gpt2Medium, Self::Gpt2Large, Self::Gpt2Xl];

    /// Model hub name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gpt2 => "gpt2",
            Self::Gpt2Medium => "gpt2-medium",
            Self::Gpt2Large => "gpt2-large",
            Self::Gpt2Xl => "gpt2-xl",
        }
    }

    /// `(n_layer, n_head, d_model)`.
    pub fn dimensions(&self) -> (usize, usize, usize) {
        match self {
            Self::Gpt2 => (12, 12, 768),
            Self::Gpt2Medium => (24, 16, 1024),
            Self::Gpt2Large => (36, 20, 1280),
            Self::Gpt2Xl => (48, 25, 1600),
        }
    }

    /// Classifier configuration matching the checkpoint, with adapters of the given rank.
    pub fn config(&self, rank: usize) -> AdaptedClassifierConfig {
        let (n_layer, n_head, d_model) = self.dimensions();
        AdaptedClassifierConfig::new(n_layer, n_head, d_model, 1024, 50257, rank)
    }
}

impl fmt::Display for PretrainedVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PretrainedVariant {
    type Err = LoraError;

    fn from_str(name: &str) -> error::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|variant| variant.name() == name)
            .ok_or_else(|| {
                LoraError::Configuration(format!(
                    "unknown pretrained model `{name}`, expected one of gpt2, gpt2-medium, gpt2-large, gpt2-xl"
                ))
            })
    }
}

/// Settings of [generate](crate::AdaptedClassifier::generate).
#[derive(Config, Debug)]
pub struct GenerationConfig {
    /// Number of tokens appended to each sequence.
    pub max_new_tokens: usize,
    /// Logits are divided by this value before sampling. Default: 1.0
    #[config(default = 1.0)]
    pub temperature: f64,
    /// Sample only among the `k` most likely tokens.
    pub top_k: Option<usize>,
    /// Seed of the sampling generator. Default: 42
    #[config(default = 42)]
    pub seed: u64,
}

impl GenerationConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.temperature <= 0.0 || !self.temperature.is_finite() {
            return Err(LoraError::Generation(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(LoraError::Generation("top_k must be at least 1".to_string()));
        }
        Ok(())
    }
}
