use burn::module::Module;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig,
};
use burn::tensor::{Int, Tensor, TensorData, backend::Backend};

use crate::block::{AdaptedBlock, AdaptedBlockConfig};
use crate::config::{AdaptedClassifierConfig, GenerationConfig};
use crate::error::{LoraError, Result};
use crate::import::{CheckpointConvention, PretrainedWeights, WeightMap};
use crate::norm::{LayerNorm, LayerNormConfig};
use crate::param::{Collector, ParamRegistry, ParamSummary, RoleApplier, RoleRules};
use crate::sampling::TopK;

/// Number of classes predicted by the head.
pub const NUM_CLASSES: usize = 2;

/// GPT-2 backbone with low-rank adapters and a two-way classification head.
///
/// Embeddings, normalizations and the base projections are frozen; the adapters and the
/// head are trained. See [ParamRegistry] for the full role table.
#[derive(Module, Debug)]
pub struct AdaptedClassifier<B: Backend> {
    pub token_embedding: Embedding<B>,
    pub position_embedding: Embedding<B>,
    dropout: Dropout,
    pub blocks: Vec<AdaptedBlock<B>>,
    pub norm_final: LayerNorm<B>,
    /// `[d_model, 2]`, no bias.
    pub head: Linear<B>,
    pub(crate) block_size: usize,
    pub(crate) n_head: usize,
    pub(crate) rank: usize,
    pub(crate) train_layer_norms: bool,
}

impl AdaptedClassifierConfig {
    /// Build the classifier with freshly initialized frozen weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<AdaptedClassifier<B>> {
        self.validate()?;

        let gpt2_init = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };
        let block = AdaptedBlockConfig::new(self.d_model, self.n_head, self.block_size, self.rank)
            .with_dropout(self.dropout)
            .with_bias(self.bias)
            .with_tile_size(self.attention_tile);
        let blocks = (0..self.n_layer)
            .map(|_| block.init(device))
            .collect::<Result<Vec<_>>>()?;

        let model = AdaptedClassifier {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.d_model)
                .with_initializer(gpt2_init.clone())
                .init(device),
            position_embedding: EmbeddingConfig::new(self.block_size, self.d_model)
                .with_initializer(gpt2_init)
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            blocks,
            norm_final: LayerNormConfig::new(self.d_model)
                .with_bias(self.bias)
                .init(device),
            head: LinearConfig::new(self.d_model, NUM_CLASSES)
                .with_bias(false)
                .init(device),
            block_size: self.block_size,
            n_head: self.n_head,
            rank: self.rank,
            train_layer_norms: self.train_layer_norms,
        }
        .apply_roles();

        log::info!("Initialized classifier: {}", model.param_summary());
        Ok(model)
    }

    /// Build the classifier and import pretrained weights into it.
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: &PretrainedWeights,
        convention: CheckpointConvention,
        device: &B::Device,
    ) -> Result<AdaptedClassifier<B>> {
        let model = self.init(device)?;
        WeightMap::gpt2(self, convention).apply(model, weights)
    }
}

impl<B: Backend> AdaptedClassifier<B> {
    /// Final normalized hidden states.
    ///
    /// # Shapes
    ///
    /// - tokens: `[batch_size, seq_length]`
    /// - output: `[batch_size, seq_length, d_model]`
    pub fn encode(&self, tokens: Tensor<B, 2, Int>) -> Result<Tensor<B, 3>> {
        let [_, seq_length] = tokens.dims();
        self.check_length(seq_length)?;

        let device = tokens.device();
        let positions = Tensor::arange(0..seq_length as i64, &device).reshape([1, seq_length]);

        let x = self.token_embedding.forward(tokens) + self.position_embedding.forward(positions);
        let x = self.dropout.forward(x);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));

        Ok(self.norm_final.forward(x))
    }

    /// Class logits of each sequence.
    ///
    /// Without a mask the last position is pooled. With a mask, where non-zero marks a real
    /// token and padding trails, the last real token is pooled.
    ///
    /// # Shapes
    ///
    /// - tokens: `[batch_size, seq_length]`
    /// - mask: `[batch_size, seq_length]`
    /// - output: `[batch_size, 2]`
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        mask: Option<Tensor<B, 2, Int>>,
    ) -> Result<Tensor<B, 2>> {
        let [batch_size, seq_length] = tokens.dims();
        self.check_length(seq_length)?;

        let positions = match mask {
            Some(mask) => pooled_positions(tokens.dims(), mask)?,
            None => vec![seq_length - 1; batch_size],
        };

        let hidden = self.encode(tokens)?;
        let [_, _, d_model] = hidden.dims();
        let device = hidden.device();

        let rows = positions
            .iter()
            .enumerate()
            .map(|(row, position)| (row * seq_length + position) as i64)
            .collect::<Vec<_>>();
        let rows = Tensor::<B, 1, Int>::from_data(TensorData::new(rows, [batch_size]), &device);

        let pooled = hidden
            .reshape([batch_size * seq_length, d_model])
            .select(0, rows);

        Ok(self.head.forward(pooled))
    }

    /// Extend each sequence by sampling from the head, one token at a time.
    ///
    /// The head only scores two classes, so the appended ids are always 0 or 1. The context
    /// is cropped to the last `block_size` tokens before each step.
    ///
    /// # Shapes
    ///
    /// - tokens: `[batch_size, seq_length]`
    /// - output: `[batch_size, seq_length + max_new_tokens]`
    pub fn generate(
        &self,
        tokens: Tensor<B, 2, Int>,
        config: &GenerationConfig,
    ) -> Result<Tensor<B, 2, Int>> {
        let mut sampler = TopK::from_config(config)?;
        let mut tokens = tokens;

        for _ in 0..config.max_new_tokens {
            let [batch_size, seq_length] = tokens.dims();
            let start = seq_length.saturating_sub(self.block_size);
            let context = tokens.clone().slice([0..batch_size, start..seq_length]);

            let logits = self.forward(context, None)?;
            let next = sampler.sample(logits)?;
            tokens = Tensor::cat(vec![tokens, next], 1);
        }

        Ok(tokens)
    }

    /// Fold every adapter into its frozen layer, leaving zeroed adapters behind.
    ///
    /// The logits are unchanged. Without `bias`, every projection gains a frozen
    /// `base.bias`, so the merged model no longer matches the pretrained [WeightMap].
    pub fn merge_adapters(mut self) -> Self {
        self.blocks = self
            .blocks
            .into_iter()
            .map(AdaptedBlock::merge_adapters)
            .collect();
        self.apply_roles()
    }

    /// Every float parameter with its path, role, shape and gradient flag.
    pub fn param_registry(&self) -> ParamRegistry {
        let mut collector = Collector::new(self.role_rules());
        self.visit(&mut collector);
        collector.registry
    }

    pub fn param_summary(&self) -> ParamSummary {
        self.param_registry().summary()
    }

    /// Maximum sequence length.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn role_rules(&self) -> RoleRules {
        RoleRules::new(self.train_layer_norms)
    }

    /// Synchronize the gradient flag of every parameter with its role.
    fn apply_roles(self) -> Self {
        let mut applier = RoleApplier::new(self.role_rules());
        self.map(&mut applier)
    }

    fn check_length(&self, seq_length: usize) -> Result<()> {
        if seq_length == 0 {
            return Err(LoraError::EmptySequence);
        }
        if seq_length > self.block_size {
            return Err(LoraError::SequenceTooLong {
                len: seq_length,
                block_size: self.block_size,
            });
        }
        Ok(())
    }
}

/// Index of the last real token of each row.
fn pooled_positions<B: Backend>(
    tokens: [usize; 2],
    mask: Tensor<B, 2, Int>,
) -> Result<Vec<usize>> {
    let dims = mask.dims();
    if dims != tokens {
        return Err(LoraError::MaskShapeMismatch { tokens, mask: dims });
    }

    let values = mask.into_data().iter::<i64>().collect::<Vec<_>>();
    values
        .chunks(tokens[1])
        .enumerate()
        .map(|(row, values)| {
            let count = values.iter().filter(|value| **value != 0).count();
            count.checked_sub(1).ok_or(LoraError::EmptyMaskRow { row })
        })
        .collect()
}
