//! Convert a DeepSeek-V1 checkpoint into per-rank engine shards.
//!
//! Usage:
//!   shardforge-convert --model-dir /path/to/deepseek-moe-16b \
//!     --output-dir out/ --dtype bf16 --tp-size 4 --pp-size 2
//!
//! Writes `config.json` and one `rank{N}.safetensors` per rank, where
//! `N = pp_rank * tp_size + tp_rank`.

mod logging;

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use serde_json::{Map, Value};

use shardforge::weights::save_safetensors;
use shardforge::{DType, Mapping, Result};
use shardforge_deepseek::{
    convert_deepseek, create_engine_config_from_hf, ConvertOptions, SourceModel,
};


/// Convert a DeepSeek-V1 checkpoint for tensor/pipeline-parallel inference
#[derive(Parser)]
#[command(name = "shardforge-convert")]
struct Cli {
    /// Path to the source checkpoint directory (config.json + SafeTensors)
    #[arg(short, long, env = "SHARDFORGE_MODEL_DIR")]
    model_dir: PathBuf,

    /// Directory to write config.json and rank files into
    #[arg(short, long, default_value = "shardforge_checkpoint")]
    output_dir: PathBuf,

    /// Target dtype: float32, float16 or bfloat16 (fp32/f16/bf16 accepted)
    #[arg(long, default_value = "float16")]
    dtype: DType,

    /// Tensor parallel size
    #[arg(long, default_value_t = 1)]
    tp_size: usize,

    /// Pipeline parallel size
    #[arg(long, default_value_t = 1)]
    pp_size: usize,

    /// Tensor parallel size within experts (derived from --moe-ep-size if unset)
    #[arg(long)]
    moe_tp_size: Option<usize>,

    /// Expert parallel size (derived from --moe-tp-size if unset)
    #[arg(long)]
    moe_ep_size: Option<usize>,

    /// Shard the vocab embedding across TP ranks
    #[arg(long)]
    use_parallel_embedding: bool,

    /// Embedding dimension to shard: 0 (vocab) or 1 (hidden)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    embedding_sharding_dim: u8,

    /// Derive lm_head from the embedding table
    #[arg(long)]
    share_embedding_table: bool,

    /// Engine config override as key=json (repeatable), e.g. --override vocab_size=102408
    #[arg(long = "override", value_name = "KEY=JSON", value_parser = parse_override)]
    overrides: Vec<(String, Value)>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

/// Split `key=value`; the value is JSON if it parses, otherwise a string.
fn parse_override(s: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=JSON, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    fn mapping(&self) -> Result<Mapping> {
        Mapping::new(0, self.tp_size, self.pp_size)?
            .with_moe_parallelism(self.moe_tp_size, self.moe_ep_size)
    }

    /// Embedding layout flags first, so explicit overrides win.
    fn engine_overrides(&self) -> Map<String, Value> {
        let mut overrides = Map::new();
        overrides.insert(
            "use_parallel_embedding".into(),
            Value::Bool(self.use_parallel_embedding),
        );
        overrides.insert(
            "embedding_sharding_dim".into(),
            Value::from(self.embedding_sharding_dim),
        );
        overrides.insert(
            "share_embedding_table".into(),
            Value::Bool(self.share_embedding_table),
        );
        overrides.extend(self.overrides.iter().cloned());
        overrides
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let start = Instant::now();
    let layout = cli.mapping()?;
    let overrides = cli.engine_overrides();

    tracing::info!(
        model_dir = %cli.model_dir.display(),
        world_size = layout.world_size(),
        tp = layout.tp_size(),
        pp = layout.pp_size(),
        moe_tp = layout.moe_tp_size(),
        moe_ep = layout.moe_ep_size(),
        dtype = %cli.dtype,
        "starting conversion"
    );

    let model = SourceModel::from_pretrained(&cli.model_dir)?;
    let config = create_engine_config_from_hf(&cli.model_dir, cli.dtype, &layout, &overrides)?;
    // Overrides may have changed the embedding layout or dtype; the rank
    // files follow whatever config.json ends up saying.
    let options = ConvertOptions::from_engine_config(&config)?;

    std::fs::create_dir_all(&cli.output_dir)?;
    let config_path = cli.output_dir.join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
    tracing::info!(path = %config_path.display(), "wrote engine config");

    for rank in 0..layout.world_size() {
        let mapping = layout.for_rank(rank)?;
        let weights = convert_deepseek(&model, &config, &mapping, &options)?;
        let path = cli.output_dir.join(format!("rank{rank}.safetensors"));
        save_safetensors(&path, &weights, None)?;
        tracing::info!(rank, tensors = weights.len(), path = %path.display(), "wrote rank");
    }

    tracing::info!(
        elapsed_secs = start.elapsed().as_secs_f64(),
        output_dir = %cli.output_dir.display(),
        "conversion finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardforge_deepseek::{engine_config_from_deepseek, DeepSeekConfig, EngineConfig};

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("vocab_size=102408").unwrap(),
            ("vocab_size".to_string(), json!(102_408))
        );
        assert_eq!(
            parse_override("moe={\"top_k\":2}").unwrap(),
            ("moe".to_string(), json!({"top_k": 2}))
        );
        assert_eq!(
            parse_override("architecture=Foo").unwrap(),
            ("architecture".to_string(), json!("Foo"))
        );
        assert!(parse_override("no_equals").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "shardforge-convert",
            "--model-dir",
            "/models/ds",
            "--dtype",
            "bf16",
            "--tp-size",
            "4",
            "--pp-size",
            "2",
            "--moe-ep-size",
            "2",
            "--use-parallel-embedding",
            "--embedding-sharding-dim",
            "1",
            "--override",
            "share_embedding_table=true",
        ])
        .unwrap();

        let mapping = cli.mapping().unwrap();
        assert_eq!(mapping.world_size(), 8);
        assert_eq!(mapping.moe_tp_size(), 2);
        assert_eq!(mapping.moe_ep_size(), 2);

        // Explicit overrides are applied after the flag-derived keys.
        let overrides = cli.engine_overrides();
        assert_eq!(overrides["share_embedding_table"], json!(true));
        assert_eq!(overrides["embedding_sharding_dim"], json!(1));

        // The rank files are converted with what config.json records.
        let options = ConvertOptions::from_engine_config(&engine_config(&cli)).unwrap();
        assert_eq!(options.dtype, DType::BF16);
        assert!(options.use_parallel_embedding);
        assert_eq!(options.embedding_sharding_dim, 1);
        assert!(options.share_embedding_table);
    }

    fn engine_config(cli: &Cli) -> EngineConfig {
        let hf: DeepSeekConfig = serde_json::from_value(json!({
            "vocab_size": 16,
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 2,
            "num_attention_heads": 2
        }))
        .unwrap();
        let mapping = cli.mapping().unwrap();
        engine_config_from_deepseek(&hf, cli.dtype, &mapping, &cli.engine_overrides()).unwrap()
    }

    #[test]
    fn test_options_follow_written_config() {
        let cli = Cli::try_parse_from([
            "shardforge-convert",
            "--model-dir",
            "/models/ds",
            "--dtype",
            "bf16",
            "--tp-size",
            "2",
            "--embedding-sharding-dim",
            "1",
            "--override",
            "use_parallel_embedding=true",
            "--override",
            "share_embedding_table=true",
        ])
        .unwrap();

        let config = engine_config(&cli);
        let options = ConvertOptions::from_engine_config(&config).unwrap();
        let written = serde_json::to_value(&config).unwrap();

        assert_eq!(written["dtype"], json!(options.dtype.label()));
        assert_eq!(
            written["use_parallel_embedding"],
            json!(options.use_parallel_embedding)
        );
        assert_eq!(
            written["embedding_sharding_dim"],
            json!(options.embedding_sharding_dim)
        );
        assert_eq!(
            written["share_embedding_table"],
            json!(options.share_embedding_table)
        );
        assert!(options.use_parallel_embedding);
        assert!(options.share_embedding_table);
        assert_eq!(options.embedding_sharding_dim, 1);
        assert_eq!(options.dtype, DType::BF16);
    }

    #[test]
    fn test_dtype_override_reaches_options() {
        let cli = Cli::try_parse_from([
            "shardforge-convert",
            "--model-dir",
            "m",
            "--override",
            "dtype=\"bfloat16\"",
        ])
        .unwrap();
        let options = ConvertOptions::from_engine_config(&engine_config(&cli)).unwrap();
        assert_eq!(options.dtype, DType::BF16);
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(Cli::try_parse_from([
            "shardforge-convert",
            "--model-dir",
            "m",
            "--dtype",
            "int8"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "shardforge-convert",
            "--model-dir",
            "m",
            "--embedding-sharding-dim",
            "2"
        ])
        .is_err());
    }
}
