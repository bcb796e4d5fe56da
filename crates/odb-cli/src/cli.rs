use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "odb",
    about = "OpenDB: a replicated object database on signed operation blocks",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a new secp256k1 key pair
    Keygen,
    /// Print the canonical hash of an operation, optionally signing it
    Hash(HashArgs),
    /// Replay operations into a fresh chain and seal them into blocks
    Bootstrap(BootstrapArgs),
    /// Replay sealed blocks into a fresh chain
    Replicate(ReplicateArgs),
}

#[derive(Args)]
pub struct HashArgs {
    /// Operation JSON file
    pub op: PathBuf,
    /// Encoded private key (`base64:PKCS#8:...`) to sign with
    #[arg(long)]
    pub sign_key: Option<String>,
    /// User written into `signed_by` before hashing
    #[arg(long)]
    pub signer: Option<String>,
}

#[derive(Args)]
pub struct BootstrapArgs {
    /// JSON file with a list of operations, or a map with an `ops` list
    pub ops: PathBuf,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Operations sealed per block
    #[arg(long, default_value = "64")]
    pub block_size: usize,
}

#[derive(Args)]
pub struct ReplicateArgs {
    /// JSON file with a list of blocks, oldest first
    pub blocks: PathBuf,
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keygen() {
        let cli = Cli::try_parse_from(["odb", "keygen"]).unwrap();
        assert!(matches!(cli.command, Command::Keygen));
    }

    #[test]
    fn parse_hash_with_key() {
        let cli = Cli::try_parse_from([
            "odb", "hash", "op.json", "--sign-key", "base64:PKCS#8:AAAA", "--signer", "alice",
        ])
        .unwrap();
        if let Command::Hash(args) = cli.command {
            assert_eq!(args.op, PathBuf::from("op.json"));
            assert_eq!(args.sign_key.as_deref(), Some("base64:PKCS#8:AAAA"));
            assert_eq!(args.signer.as_deref(), Some("alice"));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bootstrap_defaults() {
        let cli = Cli::try_parse_from(["odb", "bootstrap", "ops.json"]).unwrap();
        if let Command::Bootstrap(args) = cli.command {
            assert_eq!(args.block_size, 64);
            assert!(args.config.is_none());
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bootstrap_with_config() {
        let cli = Cli::try_parse_from([
            "odb", "bootstrap", "ops.json", "--config", "node.toml", "--block-size", "5",
        ])
        .unwrap();
        if let Command::Bootstrap(args) = cli.command {
            assert_eq!(args.config, Some(PathBuf::from("node.toml")));
            assert_eq!(args.block_size, 5);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_replicate() {
        let cli = Cli::try_parse_from(["odb", "replicate", "blocks.json"]).unwrap();
        assert!(matches!(cli.command, Command::Replicate(_)));
    }

    #[test]
    fn parse_verbose_json() {
        let cli = Cli::try_parse_from(["odb", "--verbose", "--format", "json", "keygen"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
    }
}
