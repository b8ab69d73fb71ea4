use burn::tensor::{Int, Tensor, TensorData, backend::Backend};
use rand::{
    SeedableRng,
    distr::{Distribution, weighted::WeightedIndex},
    rngs::StdRng,
};

use crate::config::GenerationConfig;
use crate::error::{LoraError, Result};

/// Temperature and top-k categorical sampling over the last dimension of logits.
#[derive(Debug)]
pub struct TopK {
    /// Logits are divided by this value.
    temperature: f64,
    /// Number of candidates kept per row, all of them when `None`.
    k: Option<usize>,
    /// RNG.
    rng: StdRng,
}

impl TopK {
    pub fn new(temperature: f64, k: Option<usize>, seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed);
        Self { temperature, k, rng }
    }

    /// Sampler described by validated generation settings.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.temperature, config.top_k, config.seed))
    }

    /// Draw one token per row of `logits` `[batch, n_classes]`, returned as `[batch, 1]`.
    pub fn sample<B: Backend>(&mut self, logits: Tensor<B, 2>) -> Result<Tensor<B, 2, Int>> {
        let [batch_size, n_classes] = logits.dims();
        let device = logits.device();
        let values = logits.into_data().iter::<f32>().collect::<Vec<_>>();

        let mut tokens = Vec::with_capacity(batch_size);
        for row in values.chunks(n_classes) {
            let weights = self.weights(row);
            let index = WeightedIndex::new(&weights)
                .map_err(|err| LoraError::Generation(format!("cannot sample from logits: {err}")))?
                .sample(&mut self.rng);
            tokens.push(index as i64);
        }

        Ok(Tensor::from_data(
            TensorData::new(tokens, [batch_size, 1]),
            &device,
        ))
    }

    /// Unnormalized probabilities of one row, zero outside the top k.
    fn weights(&self, logits: &[f32]) -> Vec<f64> {
        let scaled = logits
            .iter()
            .map(|logit| *logit as f64 / self.temperature)
            .collect::<Vec<_>>();

        // Ties at the cutoff are all kept.
        let cutoff = match self.k {
            Some(k) if k < scaled.len() => {
                let mut sorted = scaled.clone();
                sorted.sort_by(|a, b| b.total_cmp(a));
                sorted[k - 1]
            }
            _ => f64::NEG_INFINITY,
        };
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        scaled
            .into_iter()
            .map(|logit| {
                if logit < cutoff {
                    0.0
                } else {
                    (logit - max).exp()
                }
            })
            .collect()
    }
}
