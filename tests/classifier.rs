mod common;

use burn::module::Module;
use burn::nn::LinearConfig;
use burn::tensor::{Int, Tensor, activation::gelu};
use common::*;
use gpt2_lora::kernel::causal_softmax;
use gpt2_lora::{
    AdaptedClassifier, CheckpointConvention, GenerationConfig, LoraError, ParamRole,
};

fn pretrained_model() -> AdaptedClassifier<TestBackend> {
    let config = tiny_config();
    let weights = pretrained_weights(&config, CheckpointConvention::Conv1d);

    config
        .init_pretrained(&weights, CheckpointConvention::Conv1d, &Default::default())
        .unwrap()
}

fn perturb_adapters(mut model: AdaptedClassifier<TestBackend>) -> AdaptedClassifier<TestBackend> {
    let device = Default::default();

    for block in model.blocks.iter_mut() {
        block.attn.qkv.adapter.down = LinearConfig::new(8, 2).init(&device);
        block.attn.qkv.adapter.up = LinearConfig::new(2, 24).init(&device);
        block.attn.proj.adapter.up = LinearConfig::new(2, 8).init(&device);
        block.attn.proj.adapter.down = LinearConfig::new(8, 2).init(&device);
        block.ffn.expand.adapter.down = LinearConfig::new(8, 2).init(&device);
        block.ffn.expand.adapter.up = LinearConfig::new(2, 32).init(&device);
        block.ffn.contract.adapter.down = LinearConfig::new(32, 2).init(&device);
        block.ffn.contract.adapter.up = LinearConfig::new(2, 8).init(&device);
    }
    model
}

#[test]
fn end_to_end_logits_shape() {
    let model = pretrained_model();
    let tokens = token_ids::<TestBackend>(vec![1, 2, 3, 4, 5], [1, 5]);
    let mask = token_ids::<TestBackend>(vec![1; 5], [1, 5]);

    let logits = model.forward(tokens.clone(), None).unwrap();
    let masked = model.forward(tokens, Some(mask)).unwrap();

    assert_eq!(logits.dims(), [1, 2]);
    assert_eq!(to_vec(logits), to_vec(masked));
}

#[test]
fn block_size_is_the_longest_accepted_sequence() {
    let model = pretrained_model();

    let full = token_ids::<TestBackend>((0..16).map(|i| i % 10).collect(), [1, 16]);
    assert_eq!(model.forward(full, None).unwrap().dims(), [1, 2]);

    let too_long = token_ids::<TestBackend>((0..17).map(|i| i % 10).collect(), [1, 17]);
    assert!(matches!(
        model.forward(too_long, None),
        Err(LoraError::SequenceTooLong {
            len: 17,
            block_size: 16
        })
    ));
}

/// Logits of the last position computed from the frozen layers alone, one sequence.
fn base_only_logits(model: &AdaptedClassifier<TestBackend>, ids: Vec<i64>) -> Vec<f32> {
    let seq = ids.len();
    let tokens = token_ids::<TestBackend>(ids, [1, seq]);
    let positions = token_ids::<TestBackend>((0..seq as i64).collect(), [1, seq]);

    let mut x = model.token_embedding.forward(tokens) + model.position_embedding.forward(positions);
    for block in &model.blocks {
        let qkv = block.attn.qkv.base.forward(block.norm_attn.forward(x.clone()));
        let heads = |index: usize| {
            qkv.clone()
                .narrow(2, index * 8, 8)
                .reshape([1, seq, 2, 4])
                .swap_dims(1, 2)
        };
        let weights = causal_softmax(heads(0).matmul(heads(1).swap_dims(2, 3)).mul_scalar(0.5));
        let context = weights.matmul(heads(2)).swap_dims(1, 2).reshape([1, seq, 8]);
        x = x + block.attn.proj.base.forward(context);

        let hidden = gelu(block.ffn.expand.base.forward(block.norm_ffn.forward(x.clone())));
        x = x + block.ffn.contract.base.forward(hidden);
    }
    let last = model
        .norm_final
        .forward(x)
        .slice([0..1, seq - 1..seq, 0..8])
        .reshape([1, 8]);

    to_vec(model.head.forward(last))
}

#[test]
fn fresh_adapters_leave_the_backbone_unchanged() {
    let model = pretrained_model();
    let ids = vec![3, 1, 4, 1, 5, 9];

    let logits = model
        .forward(token_ids::<TestBackend>(ids.clone(), [1, 6]), None)
        .unwrap();

    assert_close(to_vec(logits), base_only_logits(&model, ids), 1e-5);
    for block in model.blocks {
        let weight = to_vec(block.attn.qkv.adapter.up.weight.val());
        assert!(weight.iter().all(|value| *value == 0.0));
    }
}

#[test]
fn trained_adapters_move_the_logits_off_the_backbone() {
    let model = perturb_adapters(pretrained_model());
    let ids = vec![3, 1, 4, 1, 5, 9];

    let logits = to_vec(
        model
            .forward(token_ids::<TestBackend>(ids.clone(), [1, 6]), None)
            .unwrap(),
    );
    let base = base_only_logits(&model, ids);

    assert!(
        logits
            .iter()
            .zip(&base)
            .any(|(adapted, base)| (adapted - base).abs() > 1e-4)
    );
}

#[test]
fn merged_adapters_give_the_same_logits() {
    let model = perturb_adapters(pretrained_model());
    let tokens = token_ids::<TestBackend>(vec![3, 1, 4, 1, 5, 9, 2, 6], [2, 4]);

    let expected = to_vec(model.forward(tokens.clone(), None).unwrap());
    let merged = model.merge_adapters();

    assert_close(to_vec(merged.forward(tokens, None).unwrap()), expected, 1e-4);
    let adapter = to_vec(merged.blocks[1].ffn.contract.adapter.down.weight.val());
    assert!(adapter.iter().all(|value| *value == 0.0));
}

#[test]
fn merging_without_bias_adds_frozen_projection_biases() {
    let model = perturb_adapters(
        tiny_config()
            .with_bias(false)
            .init::<TestBackend>(&Default::default())
            .unwrap(),
    );
    let tokens = token_ids::<TestBackend>(vec![2, 7, 1, 8], [1, 4]);
    let base_biases = |model: &AdaptedClassifier<TestBackend>| {
        model
            .param_registry()
            .entries()
            .iter()
            .filter(|entry| entry.path.ends_with(".base.bias"))
            .map(|entry| (entry.path.clone(), entry.role))
            .collect::<Vec<_>>()
    };
    let before = model.param_registry().entries().len();
    assert!(base_biases(&model).is_empty());

    let expected = to_vec(model.forward(tokens.clone(), None).unwrap());
    let merged = model.merge_adapters();

    let biases = base_biases(&merged);
    assert_eq!(biases.len(), 8);
    assert!(biases.iter().all(|(_, role)| *role == ParamRole::Frozen));
    assert!(biases.contains(&("blocks.1.ffn.expand.base.bias".to_string(), ParamRole::Frozen)));
    assert_eq!(merged.param_registry().entries().len(), before + 8);
    assert_close(to_vec(merged.forward(tokens, None).unwrap()), expected, 1e-4);
}

#[test]
fn streaming_attention_matches_explicit_attention() {
    let explicit = tiny_config().with_attention_tile(0);
    let tiled = tiny_config().with_attention_tile(3);
    let weights = pretrained_weights(&explicit, CheckpointConvention::Conv1d);
    let device = Default::default();
    let tokens = token_ids::<TestBackend>((0..12).map(|i| (i * 3) % 10).collect(), [1, 12]);

    let explicit = explicit
        .init_pretrained::<TestBackend>(&weights, CheckpointConvention::Conv1d, &device)
        .unwrap();
    let tiled = tiled
        .init_pretrained::<TestBackend>(&weights, CheckpointConvention::Conv1d, &device)
        .unwrap();

    assert_close(
        to_vec(tiled.forward(tokens.clone(), None).unwrap()),
        to_vec(explicit.forward(tokens, None).unwrap()),
        1e-5,
    );
}

#[test]
fn only_adapters_and_head_receive_gradients() {
    let config = tiny_config();
    let weights = pretrained_weights(&config, CheckpointConvention::Conv1d);
    let model = config
        .init_pretrained::<TestAutodiffBackend>(
            &weights,
            CheckpointConvention::Conv1d,
            &Default::default(),
        )
        .unwrap();

    for entry in model.param_registry().entries() {
        assert_eq!(
            entry.require_grad,
            entry.role.is_trainable(),
            "`{}` is {} but require_grad is {}",
            entry.path,
            entry.role,
            entry.require_grad
        );
    }

    let tokens = token_ids::<TestAutodiffBackend>(vec![1, 2, 3, 4], [1, 4]);
    let grads = model.forward(tokens, None).unwrap().sum().backward();

    assert!(model.head.weight.grad(&grads).is_some());
    assert!(model.blocks[0].attn.qkv.adapter.up.weight.grad(&grads).is_some());
    assert!(model.blocks[1].ffn.contract.adapter.down.weight.grad(&grads).is_some());
    assert!(model.blocks[0].attn.qkv.base.weight.grad(&grads).is_none());
    assert!(model.token_embedding.weight.grad(&grads).is_none());
    assert!(model.norm_final.weight.grad(&grads).is_none());
}

#[test]
fn layer_norms_can_join_fine_tuning() {
    let model = tiny_config()
        .with_train_layer_norms(true)
        .init::<TestAutodiffBackend>(&Default::default())
        .unwrap();
    let registry = model.param_registry();

    let norm = registry.get("blocks.1.norm_ffn.weight").unwrap();
    assert_eq!(norm.role, ParamRole::Trainable);
    assert!(norm.require_grad);

    let base = registry.get("blocks.1.ffn.expand.base.bias").unwrap();
    assert_eq!(base.role, ParamRole::Frozen);
    assert!(!base.require_grad);
}

#[test]
fn parameter_paths_follow_the_module_tree() {
    let model = pretrained_model();
    let registry = model.param_registry();

    let qkv = registry
        .get("blocks.0.attn.qkv.adapter.down.weight")
        .unwrap();
    assert_eq!(qkv.shape, vec![8, 2]);
    assert_eq!(registry.get("head.weight").unwrap().shape, vec![8, 2]);
    assert!(registry.get("head.bias").is_none());
    assert_eq!(
        registry.get("position_embedding.weight").unwrap().shape,
        vec![16, 8]
    );
    assert_eq!(model.num_params(), registry.summary().total);
}

#[test]
fn generation_appends_requested_tokens() {
    let model = pretrained_model();
    let tokens = token_ids::<TestBackend>(vec![1, 2, 3, 4, 5], [1, 5]);

    let generated = model
        .generate(tokens, &GenerationConfig::new(3).with_top_k(Some(5)))
        .unwrap();

    assert_eq!(generated.dims(), [1, 8]);
    let ids = generated.into_data().iter::<i64>().collect::<Vec<_>>();
    assert_eq!(&ids[..5], &[1, 2, 3, 4, 5]);
    assert!(ids[5..].iter().all(|id| *id == 0 || *id == 1));
}

#[test]
fn generation_crops_context_to_block_size() {
    let model = pretrained_model();
    let tokens = token_ids::<TestBackend>((0..30).map(|i| i % 10).collect(), [2, 15]);

    let generated = model.generate(tokens, &GenerationConfig::new(4)).unwrap();

    assert_eq!(generated.dims(), [2, 19]);
}

#[test]
fn generation_is_reproducible_from_the_seed() {
    let model = pretrained_model();
    let tokens = token_ids::<TestBackend>(vec![7, 7, 7], [1, 3]);
    let config = GenerationConfig::new(6).with_seed(3);

    let first = model.generate(tokens.clone(), &config).unwrap();
    let second = model.generate(tokens, &config).unwrap();

    assert_eq!(first.into_data(), second.into_data());
}

#[test]
fn generation_rejects_non_positive_temperature() {
    let model = pretrained_model();
    let tokens: Tensor<TestBackend, 2, Int> = token_ids(vec![1, 2], [1, 2]);

    let result = model.generate(tokens, &GenerationConfig::new(2).with_temperature(0.0));

    assert!(matches!(result, Err(LoraError::Generation(_))));
}
