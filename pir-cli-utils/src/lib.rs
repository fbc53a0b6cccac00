use clap::Parser;
use std::env;
use thiserror::Error;

pub struct CLIFlags {
  pub dim_sizes: Vec<u64>,
  pub alpha: u64,
  pub crypto: String,
  pub num_elements: usize,
  pub ele_size: usize,
  pub index: u64,
  pub seed: Option<u64>,
  pub list_crypto: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("{0} should be provided")]
  Missing(&'static str),
  #[error("Invalid value for {0}: {1:?}")]
  Invalid(&'static str, String),
}

#[derive(Parser)]
#[command(name = "pir-demo", version)]
#[command(about = "Flags for setting PIR parameters")]
struct Args {
  /// Comma separated size of each hypercube dimension
  #[arg(short = 'n', long, value_delimiter = ',', default_value = "4,4")]
  dim_sizes: Vec<u64>,

  /// Number of database elements aggregated per hypercube position
  #[arg(short, long, default_value_t = 2)]
  alpha: u64,

  /// Crypto parameters, see --list-crypto
  #[arg(short, long, default_value = "RLWE:1024:64")]
  crypto: String,

  /// Log2 of the number of database elements
  #[arg(short = 'm', long, default_value_t = 5)]
  num_elements: u32,

  /// Log2 of element byte length
  #[arg(short, long, default_value_t = 6)]
  ele_size: u32,

  /// Index of the element to retrieve
  #[arg(short, long, default_value_t = 9)]
  index: u64,

  /// Seed for the generated database
  #[arg(long)]
  seed: Option<u64>,

  /// Print the available crypto parameters and exit
  #[arg(long)]
  list_crypto: bool,
}

pub fn parse_cli_flags() -> CLIFlags {
  let args = Args::parse();
  CLIFlags {
    dim_sizes: args.dim_sizes,
    alpha: args.alpha,
    crypto: args.crypto,
    num_elements: exp_to_usize(args.num_elements),
    ele_size: exp_to_usize(args.ele_size),
    index: args.index,
    seed: args.seed,
    list_crypto: args.list_crypto,
  }
}

/// Reads the flags from `PIR_*` environment variables, used by benchmarks
pub fn parse_from_env() -> Result<CLIFlags, ConfigError> {
  let dim_sizes = env_var("PIR_DIM_SIZES")?
    .split(',')
    .map(|v| {
      v.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid("PIR_DIM_SIZES", v.to_string()))
    })
    .collect::<Result<Vec<u64>, _>>()?;
  let alpha = parse_env("PIR_ALPHA")?;
  let crypto = env_var("PIR_CRYPTO")?;
  let num_elements = exp_to_usize(parse_env("PIR_NUM_ELEMENTS_EXP")?);
  let ele_size = exp_to_usize(parse_env("PIR_ELE_SIZE_EXP")?);
  let index = parse_env("PIR_INDEX").unwrap_or(0);
  Ok(CLIFlags {
    dim_sizes,
    alpha,
    crypto,
    num_elements,
    ele_size,
    index,
    seed: None,
    list_crypto: false,
  })
}

fn env_var(key: &'static str) -> Result<String, ConfigError> {
  env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<T, ConfigError> {
  let v = env_var(key)?;
  v.trim().parse().map_err(|_| ConfigError::Invalid(key, v))
}

pub fn exp_to_usize(exp: u32) -> usize {
  2_usize.pow(exp)
}
