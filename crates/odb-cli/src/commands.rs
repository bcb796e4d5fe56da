use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use odb_chain::{OpBlockChain, PersistenceManager};
use odb_crypto::signer::ALGO_EC;
use odb_crypto::KeyPair;
use odb_rules::OpBlockchainRules;
use odb_types::{superblock_hash, Block, Operation};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::cli::*;
use crate::config::NodeConfig;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Keygen => cmd_keygen(&format),
        Command::Hash(args) => cmd_hash(args, &format),
        Command::Bootstrap(args) => cmd_bootstrap(args, &format),
        Command::Replicate(args) => cmd_replicate(args, &format),
    }
}

/// Summary of a chain after a replay.
#[derive(Debug, Serialize)]
struct ChainReport {
    /// Identity of the whole chain seen as one superblock.
    superblock: String,
    tip: String,
    depth: i64,
    layers: usize,
    persisted: usize,
    objects: BTreeMap<String, usize>,
}

impl ChainReport {
    fn of(chain: &OpBlockChain, persisted: usize) -> anyhow::Result<Self> {
        let depth = chain.depth()?;
        let mut objects = BTreeMap::new();
        for obj_type in chain.object_types()? {
            let count = chain.count_all_objects(&obj_type)?;
            objects.insert(obj_type, count);
        }
        Ok(Self {
            superblock: superblock_hash(depth.max(0) as usize, &chain.last_block_raw_hash()?),
            tip: chain.last_block_full_hash()?,
            depth,
            layers: chain.superblocks_depth(),
            persisted,
            objects,
        })
    }

    fn print(&self, format: &OutputFormat) -> anyhow::Result<()> {
        if let OutputFormat::Json = format {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }
        println!("{} Chain of {} blocks", "✓".green().bold(), self.depth.to_string().bold());
        println!("  Superblock: {}", self.superblock.cyan());
        println!("  Tip: {}", self.tip.yellow());
        println!("  Layers: {} ({} persisted)", self.layers, self.persisted);
        for (obj_type, count) in &self.objects {
            println!("  {:<24} {}", obj_type, count);
        }
        Ok(())
    }
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// A list, or a map holding the list under `key`.
fn json_list(value: Value, key: &str) -> anyhow::Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => bail!("expected a list under `{key}`"),
        },
        _ => bail!("expected a list or a map with `{key}`"),
    }
}

fn cmd_keygen(format: &OutputFormat) -> anyhow::Result<()> {
    let pair = KeyPair::generate();
    let private_key = pair.signing_key().to_encoded()?;
    let public_key = pair.verifying_key().to_encoded()?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "algo": ALGO_EC,
                "private_key": private_key,
                "public_key": public_key,
            }))?
        ),
        OutputFormat::Text => {
            println!("{} Generated {} key pair", "✓".green().bold(), ALGO_EC.cyan());
            println!("  Private: {}", private_key);
            println!("  Public:  {}", public_key.yellow());
        }
    }
    Ok(())
}

fn cmd_hash(args: HashArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let mut op = Operation::from_value(read_json(&args.op)?)?;
    let rules = OpBlockchainRules::default();
    if let Some(signer) = &args.signer {
        op.set_signed_by(signer)?;
    }
    let Some(key) = &args.sign_key else {
        let hash = rules.calculate_operation_hash(&op);
        match format {
            OutputFormat::Json => println!("{}", json!({ "hash": hash })),
            OutputFormat::Text => println!("{}", hash),
        }
        return Ok(());
    };
    let pair = KeyPair::from_encoded(ALGO_EC, key, None).context("decoding --sign-key")?;
    let hash = rules.generate_hash_and_sign(&mut op, &[&pair])?;
    if let OutputFormat::Text = format {
        println!("{} Signed {}", "✓".green().bold(), hash.yellow());
    }
    println!("{}", serde_json::to_string_pretty(&op.to_value(false))?);
    Ok(())
}

/// Replay `ops` into a fresh chain, sealing a block every `block_size`
/// operations. Layers that reach the configured superblock size are
/// persisted and compacted. Returns the top layer and the number of
/// persisted superblocks.
fn bootstrap(
    ops: Vec<Operation>,
    config: &NodeConfig,
    block_size: usize,
) -> anyhow::Result<(Arc<OpBlockChain>, usize)> {
    if block_size == 0 {
        bail!("block size must be positive");
    }
    let rules = Arc::new(OpBlockchainRules::new(config.rules.clone()));
    let signer = config.signer()?;
    let (user, key) = match &signer {
        Some((user, key)) => (Some(user.as_str()), Some(key)),
        None => (None, None),
    };
    let manager = PersistenceManager::new(rules.clone(), config.chain.clone());
    let mut top = OpBlockChain::new_root(rules.clone());
    let mut pending = 0;
    for (i, mut op) in ops.into_iter().enumerate() {
        if op.hash().is_none() {
            rules.generate_hash_and_sign(&mut op, &[])?;
        }
        top.add_operation(op, None)
            .with_context(|| format!("operation #{i}"))?;
        pending += 1;
        if pending == block_size {
            seal_queue(&top, user, key)?;
            pending = 0;
            if top.superblock_size() >= config.chain.superblock_size_to_persist {
                let next = OpBlockChain::new(Some(top.clone()), rules.clone())?;
                manager.persist_parent_of(&next)?;
                manager.compact_chain(&next)?;
                top = next;
            }
        }
    }
    if pending > 0 {
        seal_queue(&top, user, key)?;
    }
    info!(depth = top.depth()?, layers = top.superblocks_depth(), "bootstrap finished");
    Ok((top, manager.superblock_count()))
}

/// Create blocks until the queue is empty. One block may not hold the
/// whole queue when it exceeds the configured block limits.
fn seal_queue(chain: &OpBlockChain, user: Option<&str>, key: Option<&KeyPair>) -> anyhow::Result<()> {
    while !chain.is_queue_empty()? {
        chain.create_block(user, key)?;
    }
    Ok(())
}

fn cmd_bootstrap(args: BootstrapArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = NodeConfig::load(args.config.as_deref())?;
    let ops = json_list(read_json(&args.ops)?, "ops")?
        .into_iter()
        .map(Operation::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    let (chain, persisted) = bootstrap(ops, &config, args.block_size)?;
    ChainReport::of(&chain, persisted)?.print(format)
}

/// Replay sealed blocks, oldest first, into a fresh chain.
fn replicate(blocks: Vec<Block>, config: &NodeConfig) -> anyhow::Result<Arc<OpBlockChain>> {
    let rules = Arc::new(OpBlockchainRules::new(config.rules.clone()));
    let chain = OpBlockChain::new_root(rules);
    for mut block in blocks {
        block.make_immutable();
        let id = block.block_id();
        if !chain
            .replicate_block(&block, None)
            .with_context(|| format!("block {id}"))?
        {
            bail!("block {id} was not replicated: the chain has queued operations");
        }
    }
    Ok(chain)
}

fn cmd_replicate(args: ReplicateArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = NodeConfig::load(args.config.as_deref())?;
    let blocks = json_list(read_json(&args.blocks)?, "blocks")?
        .into_iter()
        .map(Block::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    let chain = replicate(blocks, &config)?;
    ChainReport::of(&chain, 0)?.print(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_chain::ChainConfig;
    use odb_rules::RulesConfig;
    use odb_types::OpObject;

    fn permissive(persist_at: usize) -> NodeConfig {
        NodeConfig {
            rules: RulesConfig::permissive(),
            chain: ChainConfig {
                superblock_size_to_persist: persist_at,
                ..ChainConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    fn ops(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| {
                let mut op = Operation::new("test.item");
                op.add_created(OpObject::with_id(&[format!("item-{i}")])).unwrap();
                op
            })
            .collect()
    }

    fn full_blocks(chain: &OpBlockChain) -> Vec<Block> {
        let mut blocks: Vec<Block> = chain
            .block_headers(None)
            .unwrap()
            .iter()
            .map(|h| chain.full_block_by_raw_hash(h.raw_hash()).unwrap().unwrap())
            .collect();
        blocks.reverse();
        blocks
    }

    #[test]
    fn json_list_shapes() {
        assert_eq!(json_list(json!([1, 2]), "ops").unwrap().len(), 2);
        assert_eq!(json_list(json!({"ops": [1]}), "ops").unwrap().len(), 1);
        assert!(json_list(json!({"other": [1]}), "ops").is_err());
        assert!(json_list(json!("x"), "ops").is_err());
    }

    #[test]
    fn bootstrap_seals_blocks() {
        let (chain, persisted) = bootstrap(ops(5), &permissive(32), 2).unwrap();
        assert_eq!(chain.depth().unwrap(), 3);
        assert_eq!(persisted, 0);
        let report = ChainReport::of(&chain, persisted).unwrap();
        assert_eq!(report.objects.get("test.item"), Some(&5));
        assert_eq!(report.layers, 1);
        assert!(report.superblock.starts_with("00000003"));
    }

    #[test]
    fn bootstrap_persists_full_layers() {
        let (chain, persisted) = bootstrap(ops(5), &permissive(2), 1).unwrap();
        assert_eq!(chain.depth().unwrap(), 5);
        assert_eq!(persisted, 2);
        assert_eq!(chain.superblocks_depth(), 3);
        assert!(chain.parent().unwrap().is_db_accessed());
        assert_eq!(chain.count_all_objects("test.item").unwrap(), 5);
    }

    #[test]
    fn bootstrap_splits_oversized_batches() {
        let mut config = permissive(32);
        config.rules.max_block_size_ops = 2;
        let (chain, _) = bootstrap(ops(5), &config, 5).unwrap();
        assert_eq!(chain.depth().unwrap(), 3);
        assert!(chain.is_queue_empty().unwrap());
        assert_eq!(chain.count_all_objects("test.item").unwrap(), 5);
    }

    #[test]
    fn bootstrap_rejects_zero_block_size() {
        assert!(bootstrap(ops(1), &permissive(32), 0).is_err());
    }

    #[test]
    fn replicate_reproduces_tip() {
        let (source, _) = bootstrap(ops(4), &permissive(2), 1).unwrap();
        let replica = replicate(full_blocks(&source), &permissive(32)).unwrap();
        assert_eq!(
            replica.last_block_full_hash().unwrap(),
            source.last_block_full_hash().unwrap()
        );
        assert_eq!(replica.count_all_objects("test.item").unwrap(), 4);
    }

    #[test]
    fn replicate_reports_bad_order() {
        let (source, _) = bootstrap(ops(2), &permissive(32), 1).unwrap();
        let mut blocks = full_blocks(&source);
        blocks.reverse();
        assert!(replicate(blocks, &permissive(32)).is_err());
    }
}
