//! Shared transformer building blocks.
//!
//! Layer norm, multi-head attention, and the GELU feed-forward used by both
//! the encoder and decoder stacks. Attention is written once and covers all
//! three uses: encoder self-attention (no mask, no cache), decoder causal
//! self-attention (mask + KV cache), and cross-attention (keys/values from the
//! encoder output, no mask, no cache).

use candle_core::{Device, Tensor, D};
use candle_nn::{kv_cache::KvCache, Linear, Module};

use crate::{
    error::Result,
    weights::{AttentionWeights, FeedForwardWeights, LayerNormWeights},
};

const LAYER_NORM_EPS: f64 = 1e-5;

fn linear(weight: &Tensor, bias: &Tensor) -> Linear {
    Linear::new(weight.clone(), Some(bias.clone()))
}

/// Layer normalization over the last dimension.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(w: &LayerNormWeights) -> Self {
        Self {
            weight: w.weight.clone(),
            bias: w.bias.clone(),
            eps: LAYER_NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Multi-head scaled dot-product attention.
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    n_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    pub fn new(w: &AttentionWeights, n_heads: usize) -> Result<Self> {
        let d_model = w.query_w.dim(0)?;
        let head_dim = d_model / n_heads;
        Ok(Self {
            query: linear(&w.query_w, &w.query_b),
            key: linear(&w.key_w, &w.key_b),
            value: linear(&w.value_w, &w.value_b),
            out: linear(&w.out_w, &w.out_b),
            n_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Reshape `(batch, seq, d_model)` to `(batch, heads, seq, head_dim)`.
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        Ok(x.reshape((batch, seq, self.n_heads, self.head_dim))?
            .transpose(1, 2)?)
    }

    /// Attend from `x` over `kv`.
    ///
    /// With a cache, freshly projected keys/values for the new positions are
    /// appended and the attention runs over the full cached sequence; `mask`
    /// (additive, broadcast over heads) then makes future positions
    /// unreachable before the softmax.
    pub fn forward(
        &self,
        x: &Tensor,
        kv: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;

        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(kv)?)?;
        let v = self.split_heads(&self.value.forward(kv)?)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k.contiguous()?, &v.contiguous()?)?,
            None => (k, v),
        };

        let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let out = attn
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, self.n_heads * self.head_dim))?;
        Ok(self.out.forward(&out)?)
    }
}

/// Two-layer feed-forward with GELU activation.
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub fn new(w: &FeedForwardWeights) -> Self {
        Self {
            fc1: linear(&w.fc1_w, &w.fc1_b),
            fc2: linear(&w.fc2_w, &w.fc2_b),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.gelu_erf()?;
        Ok(self.fc2.forward(&x)?)
    }
}

/// Additive causal mask of shape `(1, 1, seq_len, offset + seq_len)`.
///
/// Query position `i` (at absolute position `offset + i`) may attend to key
/// positions `j <= offset + i`; strictly-future positions get `-inf`, which
/// softmax turns into an exactly-zero weight.
pub fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, total), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_layer_norm_unit_scale() {
        let device = Device::Cpu;
        let ln = LayerNorm {
            weight: Tensor::ones(4, DType::F32, &device).unwrap(),
            bias: Tensor::zeros(4, DType::F32, &device).unwrap(),
            eps: LAYER_NORM_EPS,
        };
        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 1, 4), &device).unwrap();
        let y = ln.forward(&x).unwrap();
        let row = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mean: f32 = row.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        // Normalized values keep the input ordering.
        assert!(row[0] < row[1] && row[1] < row[2] && row[2] < row[3]);
    }

    #[test]
    fn test_causal_mask_zeroes_future_weights() {
        let device = Device::Cpu;
        let (seq, offset) = (3, 2);
        let mask = causal_mask(seq, offset, &device).unwrap();

        // Uniform scores plus the mask: future key positions must end up with
        // exactly zero probability after the softmax.
        let scores = Tensor::ones((1, 1, seq, offset + seq), DType::F32, &device).unwrap();
        let masked = scores.broadcast_add(&mask).unwrap();
        let weights = candle_nn::ops::softmax(&masked, D::Minus1).unwrap();
        let weights = weights
            .reshape((seq, offset + seq))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (i, row) in weights.iter().enumerate() {
            for (j, &w) in row.iter().enumerate() {
                if j > offset + i {
                    assert_eq!(w, 0.0, "future weight ({i},{j}) leaked");
                } else {
                    assert!(w > 0.0, "reachable weight ({i},{j}) vanished");
                }
            }
        }
    }

    #[test]
    fn test_attention_preserves_shape() {
        let device = Device::Cpu;
        let d = 8;
        let w = AttentionWeights {
            query_w: Tensor::zeros((d, d), DType::F32, &device).unwrap(),
            query_b: Tensor::zeros(d, DType::F32, &device).unwrap(),
            key_w: Tensor::zeros((d, d), DType::F32, &device).unwrap(),
            key_b: Tensor::zeros(d, DType::F32, &device).unwrap(),
            value_w: Tensor::zeros((d, d), DType::F32, &device).unwrap(),
            value_b: Tensor::zeros(d, DType::F32, &device).unwrap(),
            out_w: Tensor::zeros((d, d), DType::F32, &device).unwrap(),
            out_b: Tensor::zeros(d, DType::F32, &device).unwrap(),
        };
        let attn = MultiHeadAttention::new(&w, 2).unwrap();
        let x = Tensor::zeros((1, 5, d), DType::F32, &device).unwrap();
        let y = attn.forward(&x, &x, None, None).unwrap();
        assert_eq!(y.dims(), &[1, 5, d]);
    }
}
