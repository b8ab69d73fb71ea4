//! Causal scaled dot-product attention kernels.
//!
//! Two interchangeable implementations compute `softmax(q kᵀ * scale + causal) v`:
//!
//! - [AttentionKernel::Explicit] materializes the full `[seq, seq]` score matrix.
//! - [AttentionKernel::Tiled] streams over key tiles with an online softmax, keeping only a
//!   `[seq, tile]` block of scores alive at a time.
//!
//! Future positions are filled with `-inf` before exponentiation, so they receive a weight of
//! exactly zero in both kernels.

use burn::nn::Dropout;
use burn::nn::attention::generate_autoregressive_mask;
use burn::tensor::{Bool, Tensor, activation::softmax, backend::Backend};

/// Attention implementation used for one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKernel {
    /// Full score matrix, masked softmax.
    Explicit,
    /// Online softmax over key tiles of the given width. A width of zero attends explicitly.
    Tiled { tile_size: usize },
}

impl AttentionKernel {
    /// Pick the kernel for a sequence length.
    ///
    /// Sequences that fit in a single tile gain nothing from streaming; a tile size of zero
    /// disables tiling.
    pub fn select(seq_length: usize, tile_size: usize) -> Self {
        if tile_size == 0 || seq_length <= tile_size {
            Self::Explicit
        } else {
            Self::Tiled { tile_size }
        }
    }

    /// Attend `query` over `key`/`value`, all `[batch, n_heads, seq, d_head]`.
    pub fn forward<B: Backend>(
        &self,
        query: Tensor<B, 4>,
        key: Tensor<B, 4>,
        value: Tensor<B, 4>,
        dropout: &Dropout,
    ) -> Tensor<B, 4> {
        match *self {
            Self::Explicit | Self::Tiled { tile_size: 0 } => {
                explicit_attention(query, key, value, dropout)
            }
            Self::Tiled { tile_size } => tiled_attention(query, key, value, dropout, tile_size),
        }
    }
}

/// Causal mask `[batch, n_heads, seq, seq]`, `true` above the diagonal.
fn causal_mask<B: Backend>(
    batch_size: usize,
    n_heads: usize,
    seq_length: usize,
    device: &B::Device,
) -> Tensor<B, 4, Bool> {
    generate_autoregressive_mask::<B>(batch_size * n_heads, seq_length, device).reshape([
        batch_size,
        n_heads,
        seq_length,
        seq_length,
    ])
}

/// Causal attention weights for square scores `[batch, n_heads, seq, seq]`.
///
/// Each row sums to one over the positions at or before it; later positions are exactly zero.
pub fn causal_softmax<B: Backend>(scores: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch_size, n_heads, seq_length, _] = scores.dims();
    let mask = causal_mask::<B>(batch_size, n_heads, seq_length, &scores.device());

    softmax(scores.mask_fill(mask, f32::NEG_INFINITY), 3)
}

fn scale<B: Backend>(query: &Tensor<B, 4>) -> f64 {
    let [_, _, _, d_head] = query.dims();
    (d_head as f64).sqrt().recip()
}

fn explicit_attention<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    dropout: &Dropout,
) -> Tensor<B, 4> {
    let scale = scale(&query);
    let scores = query.matmul(key.swap_dims(2, 3)).mul_scalar(scale);
    let weights = dropout.forward(causal_softmax(scores));

    weights.matmul(value)
}

fn tiled_attention<B: Backend>(
    query: Tensor<B, 4>,
    key: Tensor<B, 4>,
    value: Tensor<B, 4>,
    dropout: &Dropout,
    tile_size: usize,
) -> Tensor<B, 4> {
    let [batch_size, n_heads, seq_length, d_head] = query.dims();
    let device = query.device();
    let scale = scale(&query);
    let mask = causal_mask::<B>(batch_size, n_heads, seq_length, &device);

    // Running row maximum, softmax denominator and weighted value sum.
    let mut running_max: Option<Tensor<B, 4>> = None;
    let mut denominator = Tensor::<B, 4>::zeros([batch_size, n_heads, seq_length, 1], &device);
    let mut accumulator =
        Tensor::<B, 4>::zeros([batch_size, n_heads, seq_length, d_head], &device);

    for start in (0..seq_length).step_by(tile_size) {
        let end = usize::min(start + tile_size, seq_length);

        let key_tile = key
            .clone()
            .slice([0..batch_size, 0..n_heads, start..end, 0..d_head]);
        let value_tile = value
            .clone()
            .slice([0..batch_size, 0..n_heads, start..end, 0..d_head]);
        let mask_tile = mask
            .clone()
            .slice([0..batch_size, 0..n_heads, 0..seq_length, start..end]);

        let scores = query
            .clone()
            .matmul(key_tile.swap_dims(2, 3))
            .mul_scalar(scale)
            .mask_fill(mask_tile, f32::NEG_INFINITY);

        // Key 0 is visible from every query, so the first tile gives a finite maximum.
        let tile_max = scores.clone().max_dim(3);
        let next_max = match running_max {
            None => tile_max,
            Some(previous) => {
                let next_max = previous
                    .clone()
                    .mask_where(tile_max.clone().greater(previous.clone()), tile_max);
                let correction = previous.sub(next_max.clone()).exp();

                denominator = denominator.mul(correction.clone());
                accumulator = accumulator.mul(correction);
                next_max
            }
        };

        let weights = scores.sub(next_max.clone()).exp();
        denominator = denominator.add(weights.clone().sum_dim(3));
        accumulator = accumulator.add(dropout.forward(weights).matmul(value_tile));
        running_max = Some(next_max);
    }

    accumulator.div(denominator)
}
