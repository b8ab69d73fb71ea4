use burn::tensor::{Int, Tensor, backend::Backend};
use gpt2_lora::{
    AdaptedClassifierConfig, CheckpointConvention, HostTensor, PretrainedWeights, WeightMap,
};

pub type TestBackend = burn::backend::NdArray<f32>;
#[allow(unused)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

/// 2 layers, 2 heads, width 8, block size 16, vocabulary 10, rank 2.
pub fn tiny_config() -> AdaptedClassifierConfig {
    AdaptedClassifierConfig::new(2, 2, 8, 16, 10, 2)
}

/// Deterministic values in `[-0.5, 0.5)`.
pub fn pattern(len: usize, salt: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 7 + salt * 13) % 17) as f32 / 17.0 - 0.5)
        .collect()
}

/// A complete pretrained file for `config`, laid out in `convention`.
#[allow(unused)]
pub fn pretrained_weights(
    config: &AdaptedClassifierConfig,
    convention: CheckpointConvention,
) -> PretrainedWeights {
    let registry = config
        .init::<TestBackend>(&Default::default())
        .unwrap()
        .param_registry();
    let mut weights = PretrainedWeights::new();

    for (salt, entry) in WeightMap::gpt2(config, convention)
        .entries()
        .iter()
        .enumerate()
    {
        let mut shape = registry.get(&entry.target).unwrap().shape.clone();
        if entry.transpose {
            shape.reverse();
        }
        let values = pattern(shape.iter().product(), salt);
        weights.insert(&entry.source, HostTensor::new(values, shape));
    }

    weights
}

#[allow(unused)]
pub fn token_ids<B: Backend>(ids: Vec<i64>, shape: [usize; 2]) -> Tensor<B, 2, Int> {
    Tensor::from_data(
        burn::tensor::TensorData::new(ids, shape),
        &Default::default(),
    )
}

#[allow(unused)]
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

#[allow(unused)]
pub fn assert_close(actual: Vec<f32>, expected: Vec<f32>, tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (index, (a, e)) in actual.iter().zip(&expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {index}: {a} differs from {e}"
        );
    }
}
