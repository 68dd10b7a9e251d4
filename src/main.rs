//! veritysetup-rs CLI
//!
//! Command-line front end for building, checking, and activating dm-verity
//! hash trees.

use clap::{Args, Parser, Subcommand};
use rsverity::core::api;
use rsverity::{HashAlgorithm, Params};
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "veritysetup-rs", version, about = "User-space dm-verity toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ParamArgs {
    /// Digest algorithm (sha1, sha256, sha512)
    #[arg(long = "hash", default_value = "sha256")]
    hash_algorithm: String,

    /// 0 adopts the on-disk superblock's value (verify/open only)
    #[arg(long = "data-block-size", default_value_t = 0)]
    data_block_size: u32,

    /// 0 adopts the on-disk superblock's value (verify/open only)
    #[arg(long = "hash-block-size", default_value_t = 0)]
    hash_block_size: u32,

    /// Hex-encoded salt, or "-" for no salt
    #[arg(long = "salt", default_value = "-")]
    salt: String,

    #[arg(long = "uuid")]
    uuid: Option<String>,

    /// Number of data blocks; 0 derives it from the data device size
    #[arg(long = "data-blocks", default_value_t = 0)]
    data_blocks: u64,

    #[arg(long = "no-superblock")]
    no_superblock: bool,

    #[arg(long = "hash-offset", default_value_t = 0)]
    hash_offset: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Build a hash tree over a data device
    Format {
        data: String,
        hash: String,
        #[command(flatten)]
        params: ParamArgs,
        /// hash_type: 0 (legacy) or 1 (normal)
        #[arg(long = "format", default_value_t = 1)]
        hash_type: u32,
    },
    /// Verify a data device against a previously built hash tree
    Verify {
        data: String,
        hash: String,
        root_hex: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Activate a kernel dm-verity mapping
    Open {
        data_dev: String,
        name: String,
        hash_dev: String,
        root_hex: String,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Remove a kernel dm-verity mapping
    Close { name: String },
    /// Print the status of a dm-verity mapping
    Status { name: String },
    /// Print a hash device's header and tree layout
    Dump { hash_dev: String },
}

enum CliError {
    Usage(String),
    Runtime(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Usage(msg) | CliError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

fn parse_salt(raw: &str) -> Result<Vec<u8>, CliError> {
    if raw == "-" {
        return Ok(Vec::new());
    }
    hex::decode(raw).map_err(|e| CliError::Usage(format!("invalid --salt hex: {e}")))
}

fn parse_root_hex(raw: &str) -> Result<Vec<u8>, CliError> {
    hex::decode(raw).map_err(|e| CliError::Usage(format!("invalid root hash hex: {e}")))
}

fn parse_uuid(raw: &Option<String>) -> Result<Option<Uuid>, CliError> {
    match raw {
        None => Ok(None),
        Some(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|e| CliError::Usage(format!("invalid --uuid: {e}"))),
    }
}

/// Default block size `format` falls back to when the user doesn't pass
/// `--data-block-size`/`--hash-block-size`. `0` on `ParamArgs` means "adopt
/// from the superblock", which `format` has none to adopt from yet.
const DEFAULT_FORMAT_BLOCK_SIZE: u32 = 4096;

fn build_params(args: &ParamArgs, hash_type: u32) -> Result<Params, CliError> {
    let algorithm = HashAlgorithm::from_name(&args.hash_algorithm)
        .map_err(|e| CliError::Usage(format!("invalid --hash: {e}")))?;
    Ok(Params {
        hash_algorithm: algorithm.name().to_string(),
        data_block_size: args.data_block_size,
        hash_block_size: args.hash_block_size,
        data_blocks: args.data_blocks,
        hash_type,
        salt: parse_salt(&args.salt)?,
        hash_area_offset: args.hash_offset,
        uuid: parse_uuid(&args.uuid)?,
        no_superblock: args.no_superblock,
    })
}

/// Builds params for `format`, substituting the CLI's own default block size
/// wherever the user left `--data-block-size`/`--hash-block-size` at `0`.
fn build_params_for_format(args: &ParamArgs, hash_type: u32) -> Result<Params, CliError> {
    let mut params = build_params(args, hash_type)?;
    if params.data_block_size == 0 {
        params.data_block_size = DEFAULT_FORMAT_BLOCK_SIZE;
    }
    if params.hash_block_size == 0 {
        params.hash_block_size = DEFAULT_FORMAT_BLOCK_SIZE;
    }
    Ok(params)
}

fn print_header(params: &Params, root_hash: &[u8]) {
    println!("VERITY header information:");
    println!("Hash type:      {}", params.hash_type);
    println!("Data blocks:    {}", params.data_blocks);
    println!("Data block size: {}", params.data_block_size);
    println!("Hash block size: {}", params.hash_block_size);
    println!("Hash algorithm: {}", params.hash_algorithm);
    if let Some(uuid) = &params.uuid {
        println!("UUID:           {uuid}");
    }
    println!(
        "Salt:           {}",
        if params.salt.is_empty() {
            "-".to_string()
        } else {
            hex::encode(&params.salt)
        }
    );
    println!("Root hash:      {}", hex::encode(root_hash));
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Format {
            data,
            hash,
            params,
            hash_type,
        } => {
            let params = build_params_for_format(&params, hash_type)?;
            let report = api::format(params, &data, &hash)
                .map_err(|e| CliError::Runtime(format!("format failed: {e}")))?;
            print_header(&report.params, &report.root_hash);
            Ok(())
        }
        Command::Verify {
            data,
            hash,
            root_hex,
            params,
        } => {
            let root = parse_root_hex(&root_hex)?;
            let params = build_params(&params, 1)?;
            api::verify(params, &data, &hash, &root)
                .map_err(|e| CliError::Runtime(format!("verification failed: {e}")))?;
            println!("Verification succeeded.");
            Ok(())
        }
        #[cfg(target_os = "linux")]
        Command::Open {
            data_dev,
            name,
            hash_dev,
            root_hex,
            params,
        } => {
            let root = parse_root_hex(&root_hex)?;
            let params = build_params(&params, 1)?;
            api::verify(params.clone(), &data_dev, &hash_dev, &root)
                .map_err(|e| CliError::Runtime(format!("verification failed: {e}")))?;

            let algorithm = HashAlgorithm::from_name(&params.hash_algorithm)
                .map_err(|e| CliError::Usage(format!("invalid --hash: {e}")))?;
            let target = rsverity::dm::TargetParams {
                version: 1,
                data_dev: data_dev.clone(),
                hash_dev: hash_dev.clone(),
                data_block_size: params.data_block_size,
                hash_block_size: params.hash_block_size,
                data_blocks: params.data_blocks,
                hash_area_offset: params.hash_area_offset,
                algorithm: algorithm.name().to_string(),
                root_hash: root,
                salt: params.salt.clone(),
                opts: Vec::new(),
                root_hash_sig_key_desc: None,
            };
            let line = target
                .to_line()
                .map_err(|e| CliError::Usage(format!("invalid target parameters: {e}")))?;

            let sectors_per_block = params.data_block_size as u64 / 512;
            let length_sectors = params.data_blocks * sectors_per_block;
            let spec = rsverity::dm::ioctl::DmTargetSpec::new(0, length_sectors, "verity");

            let path = rsverity::dm::activate(&name, &line, spec)
                .map_err(|e| CliError::Runtime(format!("activation failed: {e}")))?;
            println!("{}", path.display());
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        Command::Open { .. } => Err(CliError::Runtime(
            "device-mapper activation is only supported on Linux".to_string(),
        )),
        #[cfg(target_os = "linux")]
        Command::Close { name } => {
            let path = rsverity::dm::deactivate(&name)
                .map_err(|e| CliError::Runtime(format!("close failed: {e}")))?;
            println!("Removed {}", path.display());
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        Command::Close { .. } => Err(CliError::Runtime(
            "device-mapper deactivation is only supported on Linux".to_string(),
        )),
        #[cfg(target_os = "linux")]
        Command::Status { name } => {
            let status = rsverity::dm::status(&name)
                .map_err(|e| CliError::Runtime(format!("status failed: {e}")))?;
            println!("{}", if status.active { "active" } else { "inactive" });
            let (major, minor) = status.major_minor();
            println!("Major:minor:    {major}:{minor}");
            println!("Open count:     {}", status.open_count);
            println!("Event number:   {}", status.event_nr);
            if let Some(table) = &status.table_line {
                println!("Table:          {table}");
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        Command::Status { .. } => Err(CliError::Runtime(
            "device-mapper status is only supported on Linux".to_string(),
        )),
        Command::Dump { hash_dev } => {
            let report = api::dump(&hash_dev, None)
                .map_err(|e| CliError::Runtime(format!("dump failed: {e}")))?;
            println!("Has superblock: {}", report.has_superblock);
            println!("Hash type:      {}", report.hash_type);
            println!("Hash algorithm: {}", report.algorithm);
            println!("Data blocks:    {}", report.data_blocks);
            println!("Data block size: {}", report.data_block_size);
            println!("Hash block size: {}", report.hash_block_size);
            println!("Hash blocks:    {}", report.hash_blocks_count);
            if let Some(salt) = &report.salt_hex {
                println!("Salt:           {salt}");
            }
            println!("Hash device size: {}", report.hash_device_size);
            for (i, level) in report.levels.iter().enumerate() {
                println!(
                    "Level {i}: offset={} num_hashes={} num_blocks={}",
                    level.offset, level.num_hashes, level.num_blocks
                );
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(msg)) => {
            eprintln!("usage error: {msg}");
            ExitCode::from(2)
        }
        Err(CliError::Runtime(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
    }
}
