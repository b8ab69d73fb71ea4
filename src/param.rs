//! Named parameter inventory.
//!
//! Every float parameter of the classifier is addressed by its dotted module path
//! (`blocks.0.attn.qkv.adapter.down.weight`) and carries an explicit [ParamRole].
//! The role table is the single source of truth for what the optimizer may update:
//! the `require_grad` flag of each tensor is derived from it whenever a parameter
//! is created, imported or loaded.

use core::fmt;
use std::collections::HashMap;

use burn::module::{ModuleMapper, ModuleVisitor, Param};
use burn::tensor::{Tensor, TensorData, backend::Backend};

/// Whether a parameter is updated during fine-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    /// Pretrained weight, excluded from gradient computation.
    Frozen,
    /// Adapter or head weight, updated by the optimizer.
    Trainable,
}

impl ParamRole {
    /// True for [ParamRole::Trainable].
    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Trainable)
    }
}

impl fmt::Display for ParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frozen => f.write_str("frozen"),
            Self::Trainable => f.write_str("trainable"),
        }
    }
}

/// Path segment owning the low-rank side paths.
pub const ADAPTER_SCOPE: &str = "adapter";
/// Top-level field holding the classification head.
pub const HEAD_SCOPE: &str = "head";
/// Prefix shared by the normalization fields.
pub const NORM_SCOPE: &str = "norm";

/// Role assignment by parameter path.
///
/// - any path with an `adapter` segment is trainable;
/// - everything under `head` is trainable;
/// - parameters under a `norm*` field are trainable only when `train_layer_norms` is set;
/// - everything else is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleRules {
    pub train_layer_norms: bool,
}

impl RoleRules {
    pub fn new(train_layer_norms: bool) -> Self {
        Self { train_layer_norms }
    }

    /// Role of the parameter at `path`.
    pub fn role(&self, path: &str) -> ParamRole {
        let mut segments = path.split('.').peekable();

        if segments.peek() == Some(&HEAD_SCOPE) {
            return ParamRole::Trainable;
        }

        let mut under_norm = false;
        for segment in segments {
            if segment == ADAPTER_SCOPE {
                return ParamRole::Trainable;
            }
            under_norm |= segment.starts_with(NORM_SCOPE);
        }

        if under_norm && self.train_layer_norms {
            ParamRole::Trainable
        } else {
            ParamRole::Frozen
        }
    }
}

/// Dense float tensor held on the host, independent of any backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    /// Create a host tensor.
    ///
    /// A value count that disagrees with the shape is reported when the tensor is applied.
    pub fn new(values: Vec<f32>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            values,
        }
    }

    /// Whether the value count matches the shape.
    pub fn is_well_formed(&self) -> bool {
        self.shape.iter().product::<usize>() == self.values.len()
    }

    /// Copy a backend tensor to the host.
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Self {
        let shape = tensor.dims().to_vec();
        let values = tensor.into_data().iter::<f32>().collect();
        Self { shape, values }
    }

    /// Upload the values to `device`.
    ///
    /// The caller checks that the tensor is well formed with `D` dimensions.
    pub(crate) fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(
            TensorData::new(self.values.clone(), self.shape.clone()),
            device,
        )
    }

    /// Swap the two axes of a matrix, `None` when the tensor is not a well formed 2D tensor.
    pub fn transpose(&self) -> Option<Self> {
        let [rows, cols] = <[usize; 2]>::try_from(self.shape.as_slice()).ok()?;
        if !self.is_well_formed() {
            return None;
        }
        let mut values = vec![0.0; self.values.len()];

        for row in 0..rows {
            for col in 0..cols {
                values[col * rows + row] = self.values[row * cols + col];
            }
        }

        Some(Self {
            shape: vec![cols, rows],
            values,
        })
    }

    pub fn num_elements(&self) -> usize {
        self.values.len()
    }
}

/// One float parameter of a module graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub path: String,
    pub role: ParamRole,
    pub shape: Vec<usize>,
    /// Gradient flag of the tensor itself, always false on backends without autodiff.
    pub require_grad: bool,
}

impl ParamEntry {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parameters of a module graph in traversal order.
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
}

impl ParamRegistry {
    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    /// Entries having the given role.
    pub fn with_role(&self, role: ParamRole) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter().filter(move |entry| entry.role == role)
    }

    pub fn summary(&self) -> ParamSummary {
        let total = self.entries.iter().map(ParamEntry::num_elements).sum();
        let trainable = self
            .with_role(ParamRole::Trainable)
            .map(ParamEntry::num_elements)
            .sum();

        ParamSummary { total, trainable }
    }
}

/// Parameter counts of a module graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSummary {
    pub total: usize,
    pub trainable: usize,
}

impl ParamSummary {
    /// Share of the parameters left out of fine-tuning, in percent.
    pub fn reduction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * (self.total - self.trainable) as f64 / self.total as f64
    }
}

impl fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}M parameters, {:.2}M trainable ({:.2}% reduction)",
            self.total as f64 / 1e6,
            self.trainable as f64 / 1e6,
            self.reduction()
        )
    }
}

/// Dotted path of the module currently traversed.
#[derive(Debug, Default)]
struct PathStack {
    segments: Vec<String>,
}

impl PathStack {
    fn push(&mut self, name: &str) {
        self.segments.push(name.to_string());
    }

    fn pop(&mut self) {
        self.segments.pop();
    }

    fn current(&self) -> String {
        self.segments.join(".")
    }
}

/// Visitor building a [ParamRegistry], optionally copying the values of one role.
pub(crate) struct Collector {
    path: PathStack,
    rules: RoleRules,
    capture: Option<ParamRole>,
    pub(crate) registry: ParamRegistry,
    pub(crate) tensors: Vec<(String, HostTensor)>,
}

impl Collector {
    pub(crate) fn new(rules: RoleRules) -> Self {
        Self {
            path: PathStack::default(),
            rules,
            capture: None,
            registry: ParamRegistry::default(),
            tensors: Vec::new(),
        }
    }

    /// Also copy the values of every parameter having `role`.
    pub(crate) fn capturing(mut self, role: ParamRole) -> Self {
        self.capture = Some(role);
        self
    }
}

impl<B: Backend> ModuleVisitor<B> for Collector {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name);
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let path = self.path.current();
        let role = self.rules.role(&path);
        let tensor = param.val();

        if self.capture == Some(role) {
            self.tensors
                .push((path.clone(), HostTensor::from_tensor(tensor.clone())));
        }

        self.registry.entries.push(ParamEntry {
            path,
            role,
            shape: tensor.dims().to_vec(),
            require_grad: tensor.is_require_grad(),
        });
    }
}

/// Problem found while applying named tensors to a module graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyIssue {
    /// Source and target disagree on the shape, after any transpose.
    ShapeMismatch {
        source: String,
        target: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// The source holds a different number of values than its shape describes.
    ElementCount {
        source: String,
        shape: Vec<usize>,
        found: usize,
    },
    /// A required tensor is absent from the source.
    Missing { source: String, target: String },
    /// A source tensor has no destination.
    Unused { source: String },
}

impl fmt::Display for ApplyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                source,
                target,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch: `{source}` -> `{target}` expected {expected:?}, found {found:?}"
            ),
            Self::ElementCount {
                source,
                shape,
                found,
            } => write!(f, "malformed: `{source}` has shape {shape:?} but {found} values"),
            Self::Missing { source, target } => {
                write!(f, "missing: `{source}` (for `{target}`)")
            }
            Self::Unused { source } => write!(f, "unused: `{source}`"),
        }
    }
}

/// Outcome of applying named tensors to a module graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Target paths that received a tensor.
    pub applied: Vec<String>,
    pub issues: Vec<ApplyIssue>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn shape_mismatches(&self) -> impl Iterator<Item = &ApplyIssue> {
        self.issues
            .iter()
            .filter(|issue| matches!(issue, ApplyIssue::ShapeMismatch { .. }))
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} applied, {} issue(s)", self.applied.len(), self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  - {issue}")?;
        }
        Ok(())
    }
}

/// Tensor scheduled for a target path.
#[derive(Debug, Clone)]
pub(crate) struct Planned {
    pub(crate) source: String,
    pub(crate) tensor: HostTensor,
}

/// Mapper writing planned tensors into the parameters at their target path.
///
/// Written parameters keep their id; their gradient flag follows the role rules.
pub(crate) struct Applier {
    path: PathStack,
    rules: RoleRules,
    plan: HashMap<String, Planned>,
    report: ApplyReport,
}

impl Applier {
    pub(crate) fn new(plan: HashMap<String, Planned>, rules: RoleRules) -> Self {
        Self {
            path: PathStack::default(),
            rules,
            plan,
            report: ApplyReport::default(),
        }
    }

    /// Planned tensors never reached during the traversal are reported as unused.
    pub(crate) fn into_report(mut self) -> ApplyReport {
        let mut leftovers: Vec<String> = self.plan.into_values().map(|p| p.source).collect();
        leftovers.sort();

        self.report
            .issues
            .extend(leftovers.into_iter().map(|source| ApplyIssue::Unused { source }));
        self.report
    }
}

impl<B: Backend> ModuleMapper<B> for Applier {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name);
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let target = self.path.current();
        let Some(planned) = self.plan.remove(&target) else {
            return param;
        };

        if !planned.tensor.is_well_formed() {
            self.report.issues.push(ApplyIssue::ElementCount {
                source: planned.source,
                found: planned.tensor.num_elements(),
                shape: planned.tensor.shape,
            });
            return param;
        }

        let current = param.val();
        let expected = current.dims().to_vec();
        if planned.tensor.shape != expected {
            self.report.issues.push(ApplyIssue::ShapeMismatch {
                source: planned.source,
                target,
                expected,
                found: planned.tensor.shape,
            });
            return param;
        }

        let require_grad = self.rules.role(&target).is_trainable();
        let tensor = planned
            .tensor
            .to_tensor::<B, D>(&current.device())
            .set_require_grad(require_grad);

        log::debug!("Loaded `{}` into `{}`", planned.source, target);
        self.report.applied.push(target);
        Param::initialized(param.id, tensor)
    }
}

/// Mapper re-deriving the gradient flag of every parameter from its role.
pub(crate) struct RoleApplier {
    path: PathStack,
    rules: RoleRules,
}

impl RoleApplier {
    pub(crate) fn new(rules: RoleRules) -> Self {
        Self {
            path: PathStack::default(),
            rules,
        }
    }
}

impl<B: Backend> ModuleMapper<B> for RoleApplier {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name);
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let require_grad = self.rules.role(&self.path.current()).is_trainable();
        let id = param.id;
        let tensor = param.val().set_require_grad(require_grad);

        Param::initialized(id, tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_path_scopes() {
        let rules = RoleRules::new(false);

        assert_eq!(rules.role("head.weight"), ParamRole::Trainable);
        assert_eq!(
            rules.role("blocks.0.attn.qkv.adapter.down.weight"),
            ParamRole::Trainable
        );
        assert_eq!(rules.role("blocks.0.attn.qkv.base.weight"), ParamRole::Frozen);
        assert_eq!(rules.role("token_embedding.weight"), ParamRole::Frozen);
        assert_eq!(rules.role("blocks.1.norm_attn.weight"), ParamRole::Frozen);
        assert_eq!(rules.role("norm_final.bias"), ParamRole::Frozen);
    }

    #[test]
    fn layer_norms_can_be_trainable() {
        let rules = RoleRules::new(true);

        assert_eq!(rules.role("blocks.1.norm_ffn.bias"), ParamRole::Trainable);
        assert_eq!(rules.role("norm_final.weight"), ParamRole::Trainable);
        assert_eq!(rules.role("blocks.1.ffn.expand.base.weight"), ParamRole::Frozen);
    }

    #[test]
    fn value_count_must_match_the_shape() {
        let tensor = HostTensor::new(vec![1.0, 2.0, 3.0], [2, 2]);

        assert!(!tensor.is_well_formed());
        assert!(tensor.transpose().is_none());
        assert!(HostTensor::new(vec![0.0; 4], [2, 2]).is_well_formed());
    }

    #[test]
    fn transpose_swaps_axes() {
        let tensor = HostTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);

        let transposed = tensor.transpose().unwrap();

        assert_eq!(transposed.shape, vec![3, 2]);
        assert_eq!(transposed.values, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(transposed.transpose().unwrap(), tensor);
    }

    #[test]
    fn transpose_requires_a_matrix() {
        let tensor = HostTensor::new(vec![1.0, 2.0], [2]);

        assert!(tensor.transpose().is_none());
    }

    #[test]
    fn summary_counts_trainable_share() {
        let summary = ParamSummary {
            total: 1_000,
            trainable: 10,
        };

        assert_eq!(summary.reduction(), 99.0);
        assert_eq!(
            summary.to_string(),
            "0.00M parameters, 0.00M trainable (99.00% reduction)"
        );
    }

    #[test]
    fn report_lists_issues() {
        let report = ApplyReport {
            applied: vec!["a".into()],
            issues: vec![
                ApplyIssue::Unused { source: "x".into() },
                ApplyIssue::Missing {
                    source: "wte.weight".into(),
                    target: "token_embedding.weight".into(),
                },
            ],
        };

        assert!(!report.is_clean());
        assert_eq!(report.shape_mismatches().count(), 0);
        assert_eq!(
            report.to_string(),
            "1 applied, 2 issue(s)\n  - unused: `x`\n  - missing: `wte.weight` (for `token_embedding.weight`)"
        );
    }
}
