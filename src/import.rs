//! Import of pretrained GPT-2 weights into an [AdaptedClassifier].
//!
//! The import is driven by a [WeightMap]: one [WeightMapping] per pretrained tensor, naming
//! the parameter path it lands on and whether it must be transposed. Applying the map is
//! all-or-nothing; every shape mismatch, missing tensor and unknown tensor is collected into
//! one [ApplyReport](crate::param::ApplyReport) before failing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use burn::module::Module;
use burn::tensor::backend::Backend;
use half::{bf16, f16};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::config::AdaptedClassifierConfig;
use crate::error::{LoraError, Result};
use crate::model::AdaptedClassifier;
use crate::param::{Applier, ApplyIssue, HostTensor, Planned};

/// Prefix of the backbone tensors in sequence classification exports.
const BACKBONE_PREFIX: &str = "transformer.";

/// Layout of the projection weights in the pretrained file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointConvention {
    /// Hugging Face GPT-2 `Conv1D`, stored `[d_input, d_output]` like Burn's `Linear`.
    Conv1d,
    /// torch `nn.Linear`, stored `[d_output, d_input]`.
    Linear,
}

impl CheckpointConvention {
    fn transposes_projections(&self) -> bool {
        matches!(self, Self::Linear)
    }
}

/// Destination of one pretrained tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightMapping {
    /// Name in the pretrained file, without the backbone prefix.
    pub source: String,
    /// Parameter path in the classifier.
    pub target: String,
    /// Swap the two axes before copying.
    pub transpose: bool,
    /// Fail the import when the source is absent.
    pub required: bool,
}

impl WeightMapping {
    fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transpose: false,
            required: true,
        }
    }

    fn transposed(mut self, transpose: bool) -> Self {
        self.transpose = transpose;
        self
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Declarative source to target table for a pretrained import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightMap {
    entries: Vec<WeightMapping>,
}

impl WeightMap {
    /// Mapping of a GPT-2 checkpoint onto a classifier built from `config`.
    pub fn gpt2(config: &AdaptedClassifierConfig, convention: CheckpointConvention) -> Self {
        let transpose = convention.transposes_projections();
        let mut entries = vec![
            WeightMapping::new("wte.weight", "token_embedding.weight"),
            WeightMapping::new("wpe.weight", "position_embedding.weight"),
        ];

        let norm = |entries: &mut Vec<WeightMapping>, source: &str, target: &str| {
            entries.push(WeightMapping::new(
                format!("{source}.weight"),
                format!("{target}.weight"),
            ));
            if config.bias {
                entries.push(WeightMapping::new(
                    format!("{source}.bias"),
                    format!("{target}.bias"),
                ));
            }
        };
        let projection = |entries: &mut Vec<WeightMapping>, source: &str, target: &str| {
            entries.push(
                WeightMapping::new(format!("{source}.weight"), format!("{target}.base.weight"))
                    .transposed(transpose),
            );
            if config.bias {
                entries.push(WeightMapping::new(
                    format!("{source}.bias"),
                    format!("{target}.base.bias"),
                ));
            }
        };

        for layer in 0..config.n_layer {
            let source = format!("h.{layer}");
            let target = format!("blocks.{layer}");

            norm(&mut entries, &format!("{source}.ln_1"), &format!("{target}.norm_attn"));
            projection(&mut entries, &format!("{source}.attn.c_attn"), &format!("{target}.attn.qkv"));
            projection(&mut entries, &format!("{source}.attn.c_proj"), &format!("{target}.attn.proj"));
            norm(&mut entries, &format!("{source}.ln_2"), &format!("{target}.norm_ffn"));
            projection(&mut entries, &format!("{source}.mlp.c_fc"), &format!("{target}.ffn.expand"));
            projection(&mut entries, &format!("{source}.mlp.c_proj"), &format!("{target}.ffn.contract"));
        }
        norm(&mut entries, "ln_f", "norm_final");

        // Present only in sequence classification exports, stored as `nn.Linear`.
        entries.push(
            WeightMapping::new("score.weight", "head.weight")
                .transposed(true)
                .optional(),
        );

        Self { entries }
    }

    pub fn entries(&self) -> &[WeightMapping] {
        &self.entries
    }

    /// Pretrained tensors that are deliberately left out of the model.
    ///
    /// The causal-mask buffers are rebuilt by the attention kernel and the language model
    /// head is tied to the token embedding.
    pub fn is_excluded(source: &str) -> bool {
        source.ends_with(".attn.bias")
            || source.ends_with(".attn.masked_bias")
            || source == "lm_head.weight"
    }

    /// Copy `weights` into `model`, failing with an itemized report on any issue.
    pub fn apply<B: Backend>(
        &self,
        model: AdaptedClassifier<B>,
        weights: &PretrainedWeights,
    ) -> Result<AdaptedClassifier<B>> {
        let mut plan = HashMap::new();
        let mut issues = Vec::new();

        for entry in &self.entries {
            match weights.get(&entry.source) {
                Some(tensor) => {
                    // A non-matrix is planned as is and reported as a shape mismatch.
                    let tensor = if entry.transpose {
                        tensor.transpose().unwrap_or_else(|| tensor.clone())
                    } else {
                        tensor.clone()
                    };
                    plan.insert(
                        entry.target.clone(),
                        Planned {
                            source: entry.source.clone(),
                            tensor,
                        },
                    );
                }
                None if entry.required => issues.push(ApplyIssue::Missing {
                    source: entry.source.clone(),
                    target: entry.target.clone(),
                }),
                None => log::warn!(
                    "Optional tensor `{}` not found, `{}` keeps its initial value",
                    entry.source,
                    entry.target
                ),
            }
        }

        let mapped: HashSet<&str> = self.entries.iter().map(|e| e.source.as_str()).collect();
        issues.extend(
            weights
                .names()
                .filter(|name| !mapped.contains(name) && !Self::is_excluded(name))
                .map(|name| ApplyIssue::Unused {
                    source: name.to_string(),
                }),
        );

        let mut applier = Applier::new(plan, model.role_rules());
        let model = model.map(&mut applier);
        let mut report = applier.into_report();
        report.issues.extend(issues);

        if !report.is_clean() {
            return Err(LoraError::Import(report));
        }

        log::info!("Imported {} pretrained tensors", report.applied.len());
        Ok(model)
    }
}

/// Pretrained tensors by name, held on the host.
#[derive(Debug, Clone, Default)]
pub struct PretrainedWeights {
    tensors: BTreeMap<String, HostTensor>,
}

impl PretrainedWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor, a leading `transformer.` is removed from the name.
    pub fn insert(&mut self, name: impl AsRef<str>, tensor: HostTensor) {
        let name = name.as_ref();
        let name = name.strip_prefix(BACKBONE_PREFIX).unwrap_or(name);
        self.tensors.insert(name.to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<HostTensor> {
        self.tensors.remove(name)
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Read every tensor of a safetensors file, converting F16 and BF16 to F32.
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let file = SafeTensors::deserialize(&data)?;

        let mut weights = Self::new();
        for (name, view) in file.tensors() {
            let values = decode(&name, &view)?;
            weights.insert(&name, HostTensor::new(values, view.shape().to_vec()));
        }

        log::info!("Read {} tensors from {}", weights.len(), path.display());
        Ok(weights)
    }
}

pub(crate) fn decode(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let bytes = view.data();

    let values = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        dtype => {
            return Err(LoraError::UnsupportedDType {
                name: name.to_string(),
                dtype: format!("{dtype:?}"),
            });
        }
    };

    Ok(values)
}
