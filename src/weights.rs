//! Weight-set loading and validation.
//!
//! A [`WeightSet`] is constructed once, validated against the configuration,
//! and shared read-only (via `Arc`) by every transcription session. Weights
//! can come from an in-memory tensor map or from a model directory holding a
//! `manifest.json`, raw little-endian f32 tensor files, and a `vocab.json`
//! with the raw vocabulary strings.
//!
//! Any missing or mis-shaped tensor aborts the load; there is no partial
//! loading. The optional output projection is resolved here: when
//! `decoder.output_projection.weight` is absent, the token embedding matrix is
//! reused (weight tying), so the decode path never branches on it.

use std::{collections::HashMap, path::Path};

use candle_core::{Device, Tensor};
use serde::Deserialize;

use crate::{
    config::WhisperConfig,
    error::{Result, WhisperError},
};

/// Manifest key of the optional output projection.
const OUTPUT_PROJECTION: &str = "decoder.output_projection.weight";

/// Query/key/value/out projection weights and biases for one attention layer.
pub struct AttentionWeights {
    pub query_w: Tensor,
    pub query_b: Tensor,
    pub key_w: Tensor,
    pub key_b: Tensor,
    pub value_w: Tensor,
    pub value_b: Tensor,
    pub out_w: Tensor,
    pub out_b: Tensor,
}

/// Scale and bias for one layer norm.
pub struct LayerNormWeights {
    pub weight: Tensor,
    pub bias: Tensor,
}

/// Two-layer feed-forward weights.
pub struct FeedForwardWeights {
    pub fc1_w: Tensor,
    pub fc1_b: Tensor,
    pub fc2_w: Tensor,
    pub fc2_b: Tensor,
}

/// Weights of one encoder block.
pub struct EncoderBlockWeights {
    pub attn: AttentionWeights,
    pub ln1: LayerNormWeights,
    pub ln2: LayerNormWeights,
    pub mlp: FeedForwardWeights,
}

/// Weights of one decoder block.
pub struct DecoderBlockWeights {
    pub self_attn: AttentionWeights,
    pub cross_attn: AttentionWeights,
    pub ln1: LayerNormWeights,
    pub ln2: LayerNormWeights,
    pub ln3: LayerNormWeights,
    pub mlp: FeedForwardWeights,
}

/// Immutable, fully validated model weights.
pub struct WeightSet {
    pub config: WhisperConfig,
    /// Raw vocabulary strings, used for degraded decoding when no tokenizer
    /// is available.
    pub vocab: Vec<String>,
    pub mel_proj_w: Tensor,
    pub mel_proj_b: Tensor,
    pub pos_enc: Tensor,
    pub enc_blocks: Vec<EncoderBlockWeights>,
    pub enc_ln_post: LayerNormWeights,
    pub token_embedding: Tensor,
    pub pos_dec: Tensor,
    pub dec_blocks: Vec<DecoderBlockWeights>,
    pub dec_ln_post: LayerNormWeights,
    /// Resolved vocabulary projection, `(vocab_size, d_model)`: the explicit
    /// output projection when present, else the token embedding (tied).
    pub output_proj: Tensor,
}

/// Named tensor map with shape-checked removal.
struct TensorMap(HashMap<String, Tensor>);

impl TensorMap {
    fn take(&mut self, name: &str, dims: &[usize]) -> Result<Tensor> {
        let tensor = self
            .0
            .remove(name)
            .ok_or_else(|| WhisperError::TensorMissing(name.to_string()))?;
        if tensor.dims() != dims {
            return Err(WhisperError::ShapeMismatch(name.to_string()));
        }
        Ok(tensor)
    }

    fn take_optional(&mut self, name: &str, dims: &[usize]) -> Result<Option<Tensor>> {
        if !self.0.contains_key(name) {
            return Ok(None);
        }
        self.take(name, dims).map(Some)
    }

    fn take_attention(&mut self, prefix: &str, d: usize) -> Result<AttentionWeights> {
        Ok(AttentionWeights {
            query_w: self.take(&format!("{prefix}.query.weight"), &[d, d])?,
            query_b: self.take(&format!("{prefix}.query.bias"), &[d])?,
            key_w: self.take(&format!("{prefix}.key.weight"), &[d, d])?,
            key_b: self.take(&format!("{prefix}.key.bias"), &[d])?,
            value_w: self.take(&format!("{prefix}.value.weight"), &[d, d])?,
            value_b: self.take(&format!("{prefix}.value.bias"), &[d])?,
            out_w: self.take(&format!("{prefix}.out.weight"), &[d, d])?,
            out_b: self.take(&format!("{prefix}.out.bias"), &[d])?,
        })
    }

    fn take_layer_norm(&mut self, prefix: &str, d: usize) -> Result<LayerNormWeights> {
        Ok(LayerNormWeights {
            weight: self.take(&format!("{prefix}.weight"), &[d])?,
            bias: self.take(&format!("{prefix}.bias"), &[d])?,
        })
    }

    fn take_feed_forward(&mut self, prefix: &str, d: usize, ffn: usize) -> Result<FeedForwardWeights> {
        Ok(FeedForwardWeights {
            fc1_w: self.take(&format!("{prefix}.fc1.weight"), &[ffn, d])?,
            fc1_b: self.take(&format!("{prefix}.fc1.bias"), &[ffn])?,
            fc2_w: self.take(&format!("{prefix}.fc2.weight"), &[d, ffn])?,
            fc2_b: self.take(&format!("{prefix}.fc2.bias"), &[d])?,
        })
    }
}

impl WeightSet {
    /// Build and validate a weight set from named tensors.
    ///
    /// Every tensor the configuration implies must be present with the exact
    /// implied shape; otherwise the whole load fails with `TensorMissing` or
    /// `ShapeMismatch` naming the offending key.
    pub fn from_tensors(
        config: WhisperConfig,
        tensors: HashMap<String, Tensor>,
        vocab: Vec<String>,
    ) -> Result<Self> {
        config.validate()?;
        let d = config.d_model;
        let ffn = config.ffn_dim();
        let mut map = TensorMap(tensors);

        let mel_proj_w = map.take("encoder.mel_projection.weight", &[d, config.n_mels])?;
        let mel_proj_b = map.take("encoder.mel_projection.bias", &[d])?;
        let pos_enc = map.take("encoder.positional_embedding", &[config.max_frames, d])?;

        let mut enc_blocks = Vec::with_capacity(config.n_encoder_layers);
        for i in 0..config.n_encoder_layers {
            let p = format!("encoder.blocks.{i}");
            enc_blocks.push(EncoderBlockWeights {
                attn: map.take_attention(&format!("{p}.attn"), d)?,
                ln1: map.take_layer_norm(&format!("{p}.ln1"), d)?,
                ln2: map.take_layer_norm(&format!("{p}.ln2"), d)?,
                mlp: map.take_feed_forward(&format!("{p}.mlp"), d, ffn)?,
            });
        }
        let enc_ln_post = map.take_layer_norm("encoder.ln_post", d)?;

        let token_embedding =
            map.take("decoder.token_embedding.weight", &[config.vocab_size, d])?;
        let pos_dec = map.take("decoder.positional_embedding", &[config.max_text_tokens, d])?;

        let mut dec_blocks = Vec::with_capacity(config.n_decoder_layers);
        for i in 0..config.n_decoder_layers {
            let p = format!("decoder.blocks.{i}");
            dec_blocks.push(DecoderBlockWeights {
                self_attn: map.take_attention(&format!("{p}.self_attn"), d)?,
                cross_attn: map.take_attention(&format!("{p}.cross_attn"), d)?,
                ln1: map.take_layer_norm(&format!("{p}.ln1"), d)?,
                ln2: map.take_layer_norm(&format!("{p}.ln2"), d)?,
                ln3: map.take_layer_norm(&format!("{p}.ln3"), d)?,
                mlp: map.take_feed_forward(&format!("{p}.mlp"), d, ffn)?,
            });
        }
        let dec_ln_post = map.take_layer_norm("decoder.ln_post", d)?;

        let output_proj = match map.take_optional(OUTPUT_PROJECTION, &[config.vocab_size, d])? {
            Some(proj) => proj,
            None => token_embedding.clone(),
        };

        Ok(Self {
            config,
            vocab,
            mel_proj_w,
            mel_proj_b,
            pos_enc,
            enc_blocks,
            enc_ln_post,
            token_embedding,
            pos_dec,
            dec_blocks,
            dec_ln_post,
            output_proj,
        })
    }

    /// Load a weight set from a model directory.
    ///
    /// The directory must contain `manifest.json` (configuration plus tensor
    /// shapes and file names), the raw f32 tensor files it references, and a
    /// `vocab.json` with the vocabulary strings.
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(WhisperError::ManifestMissing(dir.to_path_buf()));
        }
        let manifest: Manifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)?;

        let vocab_data =
            std::fs::read_to_string(dir.join("vocab.json")).map_err(|_| WhisperError::VocabMissing)?;
        let vocab: Vec<String> =
            serde_json::from_str(&vocab_data).map_err(|_| WhisperError::VocabMissing)?;

        let mut tensors = HashMap::with_capacity(manifest.tensors.len());
        for (name, entry) in &manifest.tensors {
            let tensor = read_tensor(&dir.join(&entry.file), &entry.shape, name, device)?;
            tensors.insert(name.clone(), tensor);
        }

        tracing::info!(
            tensors = tensors.len(),
            vocab = vocab.len(),
            "loaded model weights from {}",
            dir.display()
        );
        Self::from_tensors(manifest.config, tensors, vocab)
    }
}

/// Model directory manifest: hyperparameters plus the tensor table.
#[derive(Debug, Deserialize)]
struct Manifest {
    config: WhisperConfig,
    tensors: HashMap<String, ManifestTensor>,
}

#[derive(Debug, Deserialize)]
struct ManifestTensor {
    shape: Vec<usize>,
    file: String,
}

/// Read a raw little-endian f32 tensor file, checking the element count
/// against the declared shape.
fn read_tensor(path: &Path, shape: &[usize], name: &str, device: &Device) -> Result<Tensor> {
    let bytes = std::fs::read(path)?;
    let expected: usize = shape.iter().product();
    if bytes.len() != expected * 4 {
        return Err(WhisperError::ShapeMismatch(name.to_string()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// All-zero weight set for a configuration; test-only scaffolding.
#[cfg(test)]
pub(crate) fn zero_weight_map(
    config: &WhisperConfig,
    device: &Device,
) -> HashMap<String, Tensor> {
    use candle_core::DType;

    let d = config.d_model;
    let ffn = config.ffn_dim();
    let mut map = HashMap::new();
    let mut put = |name: String, dims: Vec<usize>| {
        map.insert(
            name,
            Tensor::zeros(dims.as_slice(), DType::F32, device).unwrap(),
        );
    };

    put("encoder.mel_projection.weight".into(), vec![d, config.n_mels]);
    put("encoder.mel_projection.bias".into(), vec![d]);
    put("encoder.positional_embedding".into(), vec![config.max_frames, d]);
    for i in 0..config.n_encoder_layers {
        let p = format!("encoder.blocks.{i}");
        for proj in ["query", "key", "value", "out"] {
            put(format!("{p}.attn.{proj}.weight"), vec![d, d]);
            put(format!("{p}.attn.{proj}.bias"), vec![d]);
        }
        for ln in ["ln1", "ln2"] {
            put(format!("{p}.{ln}.weight"), vec![d]);
            put(format!("{p}.{ln}.bias"), vec![d]);
        }
        put(format!("{p}.mlp.fc1.weight"), vec![ffn, d]);
        put(format!("{p}.mlp.fc1.bias"), vec![ffn]);
        put(format!("{p}.mlp.fc2.weight"), vec![d, ffn]);
        put(format!("{p}.mlp.fc2.bias"), vec![d]);
    }
    put("encoder.ln_post.weight".into(), vec![d]);
    put("encoder.ln_post.bias".into(), vec![d]);

    put("decoder.token_embedding.weight".into(), vec![config.vocab_size, d]);
    put("decoder.positional_embedding".into(), vec![config.max_text_tokens, d]);
    for i in 0..config.n_decoder_layers {
        let p = format!("decoder.blocks.{i}");
        for attn in ["self_attn", "cross_attn"] {
            for proj in ["query", "key", "value", "out"] {
                put(format!("{p}.{attn}.{proj}.weight"), vec![d, d]);
                put(format!("{p}.{attn}.{proj}.bias"), vec![d]);
            }
        }
        for ln in ["ln1", "ln2", "ln3"] {
            put(format!("{p}.{ln}.weight"), vec![d]);
            put(format!("{p}.{ln}.bias"), vec![d]);
        }
        put(format!("{p}.mlp.fc1.weight"), vec![ffn, d]);
        put(format!("{p}.mlp.fc1.bias"), vec![ffn]);
        put(format!("{p}.mlp.fc2.weight"), vec![d, ffn]);
        put(format!("{p}.mlp.fc2.bias"), vec![d]);
    }
    put("decoder.ln_post.weight".into(), vec![d]);
    put("decoder.ln_post.bias".into(), vec![d]);

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn tiny_config() -> WhisperConfig {
        WhisperConfig {
            n_mels: 4,
            d_model: 8,
            n_heads: 2,
            n_encoder_layers: 1,
            n_decoder_layers: 1,
            vocab_size: 12,
            max_frames: 6,
            max_text_tokens: 10,
        }
    }

    fn tiny_vocab(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tok{i}")).collect()
    }

    #[test]
    fn test_from_tensors_succeeds() {
        let config = tiny_config();
        let device = Device::Cpu;
        let map = zero_weight_map(&config, &device);
        let ws = WeightSet::from_tensors(config.clone(), map, tiny_vocab(12)).unwrap();
        assert_eq!(ws.enc_blocks.len(), 1);
        assert_eq!(ws.dec_blocks.len(), 1);
        assert_eq!(ws.pos_enc.dims(), &[6, 8]);
    }

    #[test]
    fn test_missing_tensor_names_exact_key() {
        let config = tiny_config();
        let device = Device::Cpu;
        let mut map = zero_weight_map(&config, &device);
        map.remove("encoder.ln_post.weight");
        match WeightSet::from_tensors(config, map, tiny_vocab(12)) {
            Err(WhisperError::TensorMissing(name)) => {
                assert_eq!(name, "encoder.ln_post.weight");
            }
            other => panic!("expected TensorMissing, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let config = tiny_config();
        let device = Device::Cpu;
        let mut map = zero_weight_map(&config, &device);
        map.insert(
            "decoder.token_embedding.weight".into(),
            Tensor::zeros((3, 3), DType::F32, &device).unwrap(),
        );
        match WeightSet::from_tensors(config, map, tiny_vocab(12)) {
            Err(WhisperError::ShapeMismatch(name)) => {
                assert_eq!(name, "decoder.token_embedding.weight");
            }
            other => panic!("expected ShapeMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_output_projection_tying() {
        let config = tiny_config();
        let device = Device::Cpu;

        // Absent projection: tied to the token embedding.
        let map = zero_weight_map(&config, &device);
        let ws = WeightSet::from_tensors(config.clone(), map, tiny_vocab(12)).unwrap();
        assert_eq!(ws.output_proj.dims(), ws.token_embedding.dims());

        // Explicit projection is used as-is.
        let mut map = zero_weight_map(&config, &device);
        map.insert(
            OUTPUT_PROJECTION.into(),
            Tensor::ones((12, 8), DType::F32, &device).unwrap(),
        );
        let ws = WeightSet::from_tensors(config, map, tiny_vocab(12)).unwrap();
        let sum = ws.output_proj.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 96.0);
    }

    #[test]
    fn test_load_requires_manifest() {
        let dir = std::env::temp_dir().join("sotto-empty-model-dir");
        std::fs::create_dir_all(&dir).unwrap();
        match WeightSet::load(&dir, &Device::Cpu) {
            Err(WhisperError::ManifestMissing(_)) => {}
            other => panic!("expected ManifestMissing, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_read_tensor_checks_element_count() {
        let dir = std::env::temp_dir();
        let path = dir.join("sotto-bad-tensor.bin");
        // 3 floats declared as a (2, 2) tensor.
        std::fs::write(&path, [0u8; 12]).unwrap();
        match read_tensor(&path, &[2, 2], "some.tensor", &Device::Cpu) {
            Err(WhisperError::ShapeMismatch(name)) => assert_eq!(name, "some.tensor"),
            other => panic!("expected ShapeMismatch, got {:?}", other.err()),
        }
    }
}
