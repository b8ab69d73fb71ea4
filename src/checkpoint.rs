//! Checkpoints of the trainable parameters only.
//!
//! The file is a safetensors archive keyed by parameter path (`head.weight`,
//! `blocks.0.attn.qkv.adapter.down.weight`, ...). Its metadata records the architecture, and
//! loading refuses a file written for a different one.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use burn::module::Module;
use burn::tensor::backend::Backend;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::error::{LoraError, Result};
use crate::import::decode;
use crate::model::AdaptedClassifier;
use crate::param::{Applier, ApplyIssue, Collector, HostTensor, ParamRole, Planned};

/// Value of the `format` metadata entry.
pub const CHECKPOINT_FORMAT: &str = "gpt2-lora/trainable";

impl<B: Backend> AdaptedClassifier<B> {
    /// Write every trainable parameter to `path`.
    pub fn save_trainable(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut collector = Collector::new(self.role_rules()).capturing(ParamRole::Trainable);
        self.visit(&mut collector);

        let views = collector
            .tensors
            .iter()
            .map(|(name, tensor)| {
                let bytes: &[u8] = bytemuck::cast_slice(tensor.values.as_slice());
                let view = TensorView::new(Dtype::F32, tensor.shape.clone(), bytes)?;
                Ok((name.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        let metadata: HashMap<String, String> = self.architecture().into_iter().collect();
        let bytes = safetensors::serialize(views, Some(metadata))?;
        std::fs::write(path, bytes)?;

        log::info!(
            "Saved {} trainable tensors to {}",
            collector.tensors.len(),
            path.display()
        );
        Ok(())
    }

    /// Replace the trainable parameters with the ones stored at `path`.
    ///
    /// Every trainable parameter must be in the file with its exact shape, and the file may
    /// hold nothing else. Frozen parameters are never modified.
    pub fn load_trainable(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data)?;
        let stored = header.metadata().clone().unwrap_or_default();
        for (key, expected) in self.architecture() {
            let found = stored
                .get(&key)
                .cloned()
                .unwrap_or_else(|| "absent".to_string());
            if found != expected {
                return Err(LoraError::CheckpointArchitecture {
                    key,
                    expected,
                    found,
                });
            }
        }

        let rules = self.role_rules();
        let file = SafeTensors::deserialize(&data)?;
        let mut plan = HashMap::new();
        let mut issues = Vec::new();

        for (name, view) in file.tensors() {
            if !rules.role(&name).is_trainable() {
                issues.push(ApplyIssue::Unused { source: name });
                continue;
            }
            let tensor = HostTensor::new(decode(&name, &view)?, view.shape().to_vec());
            plan.insert(
                name.clone(),
                Planned {
                    source: name,
                    tensor,
                },
            );
        }

        for entry in self.param_registry().with_role(ParamRole::Trainable) {
            if !plan.contains_key(&entry.path) {
                issues.push(ApplyIssue::Missing {
                    source: entry.path.clone(),
                    target: entry.path.clone(),
                });
            }
        }

        let mut applier = Applier::new(plan, rules);
        let model = self.map(&mut applier);
        let mut report = applier.into_report();
        report.issues.extend(issues);

        if !report.is_clean() {
            return Err(LoraError::Checkpoint(report));
        }

        log::info!(
            "Loaded {} trainable tensors from {}",
            report.applied.len(),
            path.display()
        );
        Ok(model)
    }

    /// Metadata identifying the architecture a checkpoint belongs to.
    fn architecture(&self) -> BTreeMap<String, String> {
        let [vocab_size, d_model] = self.token_embedding.weight.val().dims();

        [
            ("format", CHECKPOINT_FORMAT.to_string()),
            ("rank", self.rank.to_string()),
            ("n_layer", self.blocks.len().to_string()),
            ("n_head", self.n_head.to_string()),
            ("d_model", d_model.to_string()),
            ("vocab_size", vocab_size.to_string()),
            ("train_layer_norms", self.train_layer_norms.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}
