//! Weight conversion from DeepSeek-V1 checkpoint names to engine shards.
//!
//! For one rank of the [`Mapping`], walks the pipeline stage's layers in
//! order, slices every projection for this TP rank, and renames it:
//!
//! | source (`model.layers.{l}.`)              | target (`transformer.layers.{local}.`) |
//! |-------------------------------------------|----------------------------------------|
//! | `self_attn.{q,k,v}_proj`                  | `attention.qkv` (fused)                |
//! | `self_attn.o_proj`                        | `attention.dense`                      |
//! | `mlp.experts.{e}.{up,gate}_proj`          | `mlp.moe.fc` (stacked, up then gate)   |
//! | `mlp.experts.{e}.down_proj`               | `mlp.moe.proj` (stacked)               |
//! | `mlp.gate`                                | `mlp.moe.router` (always f32)          |
//! | `mlp.shared_experts.{gate,down,up}_proj`  | `mlp.shared_experts.{fc,proj,gate}`    |
//! | `mlp.{up,gate,down}_proj`                 | `mlp.{gate,fc,proj}`                   |
//! | `input_layernorm`                         | `input_layernorm`                      |
//! | `post_attention_layernorm`                | `post_layernorm`                       |

#![allow(clippy::doc_markdown)]

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use shardforge::weights::{
    host_concat, host_pad_rows, host_shard_tensor, host_split, host_stack, HostTensor,
};
use shardforge::{
    pad_vocab_size, shard_strategy_for_weight, DType, Error, Mapping, MoeConfig,
    ParameterSource, Result, ShardConfig, ShardStrategy,
};

use crate::model::SourceModel;
use crate::translate::EngineConfig;

/// Converted weights for one rank, keyed by engine tensor name.
pub type ConvertedWeights = BTreeMap<String, HostTensor>;

/// Per-run conversion switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Target dtype for every weight except the MoE router
    pub dtype: DType,
    /// Shard the vocab embedding across TP ranks
    pub use_parallel_embedding: bool,
    /// Dimension the vocab embedding is sharded along (0 = vocab, 1 = hidden)
    pub embedding_sharding_dim: usize,
    /// Derive `lm_head` from the embedding even if the source config doesn't
    /// tie them
    pub share_embedding_table: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            use_parallel_embedding: false,
            embedding_sharding_dim: 0,
            share_embedding_table: false,
        }
    }
}

impl ConvertOptions {
    /// Read the options back out of a finished engine config, so the weights
    /// always match what the config records. Missing embedding keys take the
    /// defaults.
    ///
    /// # Errors
    /// Returns an error if the dtype label is unknown, an embedding key has
    /// the wrong JSON type, or the sharding dimension isn't 0 or 1.
    pub fn from_engine_config(config: &EngineConfig) -> Result<Self> {
        let flag = |key: &str| -> Result<bool> {
            match config.extra.get(key) {
                None => Ok(false),
                Some(value) => value
                    .as_bool()
                    .ok_or_else(|| Error::Other(format!("{key} must be a boolean, got {value}"))),
            }
        };

        let embedding_sharding_dim = match config.extra.get("embedding_sharding_dim") {
            None => 0,
            Some(value) => match value.as_u64() {
                Some(0) => 0,
                Some(1) => 1,
                _ => {
                    return Err(Error::Other(format!(
                        "embedding_sharding_dim must be 0 or 1, got {value}"
                    )))
                }
            },
        };

        Ok(Self {
            dtype: config.dtype.parse()?,
            use_parallel_embedding: flag("use_parallel_embedding")?,
            embedding_sharding_dim,
            share_embedding_table: flag("share_embedding_table")?,
        })
    }
}

/// Split a fused `(3H, H)` QKV weight for one TP rank.
///
/// The weight is viewed as `(3, H, H)` so each rank takes the same slice of
/// Q, K, and V, and the result is `(3H/T, H)` with this rank's Q rows, then
/// its K rows, then its V rows.
///
/// # Errors
/// Returns an error if the weight isn't `(3H, H)` or `H` isn't divisible by
/// the TP size.
pub fn split_qkv_tp(
    qkv: &HostTensor,
    hidden_size: usize,
    shard: &ShardConfig,
) -> Result<HostTensor> {
    let per_proj = qkv.clone().reshape(&[3, hidden_size, hidden_size])?;
    let split = host_split(&per_proj, shard, 1)?;
    split.reshape(&[3 * (hidden_size / shard.world_size), hidden_size])
}

/// Pad the vocab dimension (dim 0) so it divides evenly across `tp_size`.
///
/// # Errors
/// Returns an error if `tp_size` is zero or `tensor` is 0-d.
pub fn pad_vocab(tensor: HostTensor, vocab_size: usize, tp_size: usize) -> Result<HostTensor> {
    if tp_size == 0 {
        return Err(Error::InvalidShape("pad_vocab: tp_size must be positive".into()));
    }
    if vocab_size % tp_size == 0 {
        return Ok(tensor);
    }
    let pad_width = pad_vocab_size(vocab_size, tp_size) - vocab_size;
    let rows = tensor.shape.first().copied().unwrap_or(0);
    host_pad_rows(&tensor, rows + pad_width)
}

/// Convert one rank's share of a DeepSeek-V1 checkpoint.
///
/// Layers in `mapping.pp_layers(..)` are converted in order; the embedding
/// is emitted on the first pipeline stage and `lm_head` on the last, with
/// `transformer.ln_f.weight` emitted on every stage.
///
/// # Errors
/// Returns the first failure: a missing weight, a shape that can't be split
/// for this layout, or an invalid expert layout. No partial result is
/// returned.
pub fn convert_deepseek<P: ParameterSource>(
    model: &SourceModel<P>,
    config: &EngineConfig,
    mapping: &Mapping,
    options: &ConvertOptions,
) -> Result<ConvertedWeights> {
    let start = Instant::now();
    let converter = Converter {
        params: model.params(),
        config,
        mapping,
        dtype: options.dtype,
        tp: mapping.tp_shard(),
    };

    let mut weights = ConvertedWeights::new();
    let layers = mapping.pp_layers(config.num_hidden_layers);
    tracing::info!(
        rank = mapping.rank(),
        tp_rank = mapping.tp_rank(),
        pp_rank = mapping.pp_rank(),
        layers = ?layers,
        dtype = %options.dtype,
        "converting DeepSeek weights"
    );

    for layer in layers.clone() {
        converter.convert_layer(layer, &layers, &mut weights)?;
    }

    let tied = model.config().tie_word_embeddings || options.share_embedding_table;
    converter.convert_embedding_and_head(tied, options, &mut weights)?;

    let ln_f = converter.params.load("model.norm.weight", options.dtype)?;
    weights.insert("transformer.ln_f.weight".to_string(), ln_f);

    tracing::info!(
        tensors = weights.len(),
        elapsed = %format_elapsed(start.elapsed()),
        "Weights converted"
    );
    Ok(weights)
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

struct Converter<'a, P> {
    params: &'a P,
    config: &'a EngineConfig,
    mapping: &'a Mapping,
    dtype: DType,
    tp: ShardConfig,
}

impl<P: ParameterSource> Converter<'_, P> {
    fn moe(&self) -> &MoeConfig {
        &self.config.moe
    }

    /// Load a 2D source weight and slice it by its name-derived strategy.
    fn load_tp(&self, name: &str) -> Result<HostTensor> {
        self.params
            .load_sharded(name, self.dtype, &self.tp, shard_strategy_for_weight(name))
    }

    /// Convert one global layer. Intermediates are dropped on return, so at
    /// most one layer's worth is alive at a time.
    fn convert_layer(
        &self,
        layer: usize,
        stage: &Range<usize>,
        weights: &mut ConvertedWeights,
    ) -> Result<()> {
        let local = layer - stage.start;
        let src = format!("model.layers.{layer}.");
        let dst = format!("transformer.layers.{local}.");
        tracing::info!(layer, local, "converting layer");

        // --- Attention ---
        let q = self.params.load(&format!("{src}self_attn.q_proj.weight"), self.dtype)?;
        let k = self.params.load(&format!("{src}self_attn.k_proj.weight"), self.dtype)?;
        let v = self.params.load(&format!("{src}self_attn.v_proj.weight"), self.dtype)?;
        let qkv = host_concat(&[&q, &k, &v], 0)?;
        drop((q, k, v));
        weights.insert(
            format!("{dst}attention.qkv.weight"),
            split_qkv_tp(&qkv, self.config.hidden_size, &self.tp)?,
        );

        weights.insert(
            format!("{dst}attention.dense.weight"),
            self.load_tp(&format!("{src}self_attn.o_proj.weight"))?,
        );

        // --- Feed-forward ---
        // Layer 0 of DeepSeek-V1 is always a dense MLP.
        if self.moe().has_moe() && layer > 0 {
            self.convert_moe(&src, &dst, weights)?;
        } else {
            self.convert_dense_mlp(&src, &dst, weights)?;
        }

        // --- Norms (replicated) ---
        weights.insert(
            format!("{dst}input_layernorm.weight"),
            self.params
                .load(&format!("{src}input_layernorm.weight"), self.dtype)?,
        );
        weights.insert(
            format!("{dst}post_layernorm.weight"),
            self.params
                .load(&format!("{src}post_attention_layernorm.weight"), self.dtype)?,
        );

        Ok(())
    }

    /// Expert indices this rank holds, ascending.
    fn rank_experts(&self) -> Result<Vec<usize>> {
        let num_experts = self.moe().num_experts;
        if self.mapping.has_moe_ep() {
            self.mapping.ep_experts(num_experts)
        } else {
            Ok((0..num_experts).collect())
        }
    }

    /// Stack one projection of every expert in `experts` into
    /// `[experts, out, in]`.
    fn stack_experts(&self, src: &str, experts: &[usize], proj: &str) -> Result<HostTensor> {
        let per_expert = experts
            .iter()
            .map(|e| {
                self.params
                    .load(&format!("{src}mlp.experts.{e}.{proj}.weight"), self.dtype)
            })
            .collect::<Result<Vec<_>>>()?;
        host_stack(&per_expert)
    }

    fn convert_moe(&self, src: &str, dst: &str, weights: &mut ConvertedWeights) -> Result<()> {
        let experts = self.rank_experts()?;
        tracing::debug!(experts = experts.len(), "stacking routed experts");

        let mut gate = self.stack_experts(src, &experts, "gate_proj")?;
        let mut up = self.stack_experts(src, &experts, "up_proj")?;
        let mut down = self.stack_experts(src, &experts, "down_proj")?;

        if self.mapping.has_moe_tp() {
            let shard = self.mapping.moe_tp_shard();
            gate = host_shard_tensor(&gate, &shard, ShardStrategy::Column)?;
            up = host_shard_tensor(&up, &shard, ShardStrategy::Column)?;
            down = host_shard_tensor(&down, &shard, ShardStrategy::Row)?;
        }

        // [experts, 2 * inter, hidden], up rows first.
        let fc = host_concat(&[&up, &gate], 1)?;
        drop((up, gate));
        weights.insert(format!("{dst}mlp.moe.fc.weight"), fc);
        weights.insert(format!("{dst}mlp.moe.proj.weight"), down);

        // Routing logits are computed in f32 whatever the weight dtype.
        weights.insert(
            format!("{dst}mlp.moe.router.weight"),
            self.params.load(&format!("{src}mlp.gate.weight"), DType::F32)?,
        );

        if self.moe().num_shared_experts > 0 {
            let shared = format!("{src}mlp.shared_experts.");
            weights.insert(
                format!("{dst}mlp.shared_experts.fc.weight"),
                self.load_tp(&format!("{shared}gate_proj.weight"))?,
            );
            weights.insert(
                format!("{dst}mlp.shared_experts.proj.weight"),
                self.load_tp(&format!("{shared}down_proj.weight"))?,
            );
            weights.insert(
                format!("{dst}mlp.shared_experts.gate.weight"),
                self.load_tp(&format!("{shared}up_proj.weight"))?,
            );
        }

        Ok(())
    }

    fn convert_dense_mlp(
        &self,
        src: &str,
        dst: &str,
        weights: &mut ConvertedWeights,
    ) -> Result<()> {
        // The engine's gated MLP names the up projection `gate` and the
        // gate projection `fc`.
        weights.insert(
            format!("{dst}mlp.gate.weight"),
            self.load_tp(&format!("{src}mlp.up_proj.weight"))?,
        );
        weights.insert(
            format!("{dst}mlp.fc.weight"),
            self.load_tp(&format!("{src}mlp.gate_proj.weight"))?,
        );
        weights.insert(
            format!("{dst}mlp.proj.weight"),
            self.load_tp(&format!("{src}mlp.down_proj.weight"))?,
        );
        Ok(())
    }

    /// Emit `transformer.vocab_embedding.weight` and `lm_head.weight`.
    ///
    /// A tied head is written first; an explicit `lm_head.weight` in the
    /// source is written after it and wins.
    fn convert_embedding_and_head(
        &self,
        tied: bool,
        options: &ConvertOptions,
        weights: &mut ConvertedWeights,
    ) -> Result<()> {
        let vocab_size = self.config.vocab_size;
        let tp_size = self.tp.world_size;
        let is_last = self.mapping.is_last_pp_rank();

        let mut embedding = self.params.load("model.embed_tokens.weight", self.dtype)?;
        if tied && is_last {
            // The padded table is also what the first stage embeds with.
            embedding = pad_vocab(embedding, vocab_size, tp_size)?;
            weights.insert(
                "lm_head.weight".to_string(),
                host_split(&embedding, &self.tp, 0)?,
            );
        }
        if options.use_parallel_embedding {
            embedding = host_split(&embedding, &self.tp, options.embedding_sharding_dim)?;
        }
        if self.mapping.is_first_pp_rank() {
            weights.insert("transformer.vocab_embedding.weight".to_string(), embedding);
        }

        if is_last {
            if self.params.contains("lm_head.weight") {
                let head = self.params.load("lm_head.weight", self.dtype)?;
                let head = pad_vocab(head, vocab_size, tp_size)?;
                weights.insert(
                    "lm_head.weight".to_string(),
                    host_shard_tensor(&head, &self.tp, ShardStrategy::Column)?,
                );
            } else if !weights.contains_key("lm_head.weight") {
                return Err(Error::WeightNotFound("lm_head.weight".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(rank: usize, world_size: usize) -> ShardConfig {
        ShardConfig { rank, world_size }
    }

    #[allow(clippy::cast_precision_loss)]
    fn arange(shape: &[usize], offset: f32) -> HostTensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|i| offset + i as f32).collect();
        HostTensor::from_slice(shape, &values).unwrap()
    }

    #[test]
    fn test_split_qkv_reassembles_for_every_tp_size() {
        let hidden = 12;
        let q = arange(&[hidden, hidden], 0.0);
        let k = arange(&[hidden, hidden], 1000.0);
        let v = arange(&[hidden, hidden], 2000.0);
        let qkv = host_concat(&[&q, &k, &v], 0).unwrap();

        for tp in [1, 2, 3, 4, 6, 12] {
            let shards: Vec<HostTensor> = (0..tp)
                .map(|rank| split_qkv_tp(&qkv, hidden, &shard(rank, tp)).unwrap())
                .collect();
            for s in &shards {
                assert_eq!(s.shape, vec![3 * hidden / tp, hidden]);
            }

            // Undo the per-rank interleave: each shard is (3, H/T, H).
            let per_proj: Vec<HostTensor> = shards
                .into_iter()
                .map(|s| s.reshape(&[3, hidden / tp, hidden]).unwrap())
                .collect();
            let refs: Vec<&HostTensor> = per_proj.iter().collect();
            let rebuilt = host_concat(&refs, 1)
                .unwrap()
                .reshape(&[3 * hidden, hidden])
                .unwrap();
            assert_eq!(rebuilt, qkv, "tp={tp}");
        }
    }

    #[test]
    fn test_split_qkv_rank_holds_matching_slices() {
        let hidden = 4;
        let q = arange(&[hidden, hidden], 0.0);
        let k = arange(&[hidden, hidden], 100.0);
        let v = arange(&[hidden, hidden], 200.0);
        let qkv = host_concat(&[&q, &k, &v], 0).unwrap();

        let second = split_qkv_tp(&qkv, hidden, &shard(1, 2)).unwrap();
        let rows: Vec<f32> = second
            .as_f32_slice()
            .iter()
            .step_by(hidden)
            .copied()
            .collect();
        // Rows 2 and 3 of each projection.
        assert_eq!(rows, vec![8.0, 12.0, 108.0, 112.0, 208.0, 212.0]);
    }

    #[test]
    fn test_split_qkv_rejects_indivisible_hidden() {
        let qkv = arange(&[3 * 6, 6], 0.0);
        assert!(split_qkv_tp(&qkv, 6, &shard(0, 4)).is_err());
        assert!(split_qkv_tp(&arange(&[10, 6], 0.0), 6, &shard(0, 2)).is_err());
    }

    #[test]
    fn test_pad_vocab() {
        let table = arange(&[7, 2], 1.0);
        let padded = pad_vocab(table.clone(), 7, 4).unwrap();
        assert_eq!(padded.shape, vec![8, 2]);
        assert_eq!(&padded.as_f32_slice()[..14], table.as_f32_slice());
        assert_eq!(&padded.as_f32_slice()[14..], &[0.0, 0.0]);

        for rank in 0..4 {
            let part = host_split(&padded, &shard(rank, 4), 0).unwrap();
            assert_eq!(part.shape, vec![2, 2]);
        }

        assert_eq!(pad_vocab(table.clone(), 7, 7).unwrap(), table);
        assert_eq!(pad_vocab(table.clone(), 7, 1).unwrap(), table);
    }

    #[test]
    fn test_pad_vocab_rejects_zero_tp() {
        let err = pad_vocab(arange(&[7, 2], 1.0), 7, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)));
    }

    #[test]
    fn test_pad_vocab_smallest_multiple() {
        for (vocab, tp) in [(5, 2), (9, 4), (10, 3), (13, 8)] {
            let padded = pad_vocab(arange(&[vocab, 1], 1.0), vocab, tp).unwrap();
            let rows = padded.shape[0];
            assert_eq!(rows % tp, 0);
            assert!(rows >= vocab && rows - vocab < tp);
            assert!(padded.as_f32_slice()[vocab..].iter().all(|&x| x == 0.0));
        }
    }

    fn engine_config(overrides: serde_json::Value) -> EngineConfig {
        let hf: crate::DeepSeekConfig = serde_json::from_value(serde_json::json!({
            "vocab_size": 10,
            "hidden_size": 4,
            "intermediate_size": 8,
            "num_hidden_layers": 2,
            "num_attention_heads": 2
        }))
        .unwrap();
        let serde_json::Value::Object(overrides) = overrides else {
            panic!("overrides must be an object");
        };
        crate::engine_config_from_deepseek(&hf, DType::BF16, &Mapping::single(), &overrides)
            .unwrap()
    }

    #[test]
    fn test_options_from_engine_config() {
        let config = engine_config(serde_json::json!({}));
        let options = ConvertOptions::from_engine_config(&config).unwrap();
        assert_eq!(
            options,
            ConvertOptions {
                dtype: DType::BF16,
                ..ConvertOptions::default()
            }
        );

        let config = engine_config(serde_json::json!({
            "dtype": "float16",
            "use_parallel_embedding": true,
            "embedding_sharding_dim": 1,
            "share_embedding_table": true
        }));
        let options = ConvertOptions::from_engine_config(&config).unwrap();
        assert_eq!(options.dtype, DType::F16);
        assert!(options.use_parallel_embedding);
        assert_eq!(options.embedding_sharding_dim, 1);
        assert!(options.share_embedding_table);
    }

    #[test]
    fn test_options_reject_bad_embedding_keys() {
        for bad in [
            serde_json::json!({ "use_parallel_embedding": "yes" }),
            serde_json::json!({ "embedding_sharding_dim": 2 }),
            serde_json::json!({ "dtype": "int8" }),
        ] {
            let config = engine_config(bad.clone());
            assert!(ConvertOptions::from_engine_config(&config).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_elapsed(Duration::from_millis(900)), "00:00:00");
    }
}
