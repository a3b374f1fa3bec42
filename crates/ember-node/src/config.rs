//! Node configuration and the CLI/environment settings surface.

use std::collections::HashMap;

use ember_core::amount::FeeRate;
use ember_core::constants::{NetworkType, MAX_BLOCK_SERIALIZED_SIZE, WITNESS_SCALE_FACTOR};
use ember_core::error::MinerError;
use ember_miner::{parse_money, AssemblerOptions};
use ember_mempool::MempoolOptions;

/// Configuration for a node instance.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: NetworkType,
    pub mempool: MempoolOptions,
    pub assembler: AssemblerOptions,
    /// Log level filter string (e.g. "info", "ember_mempool=trace").
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::default(),
            mempool: MempoolOptions::default(),
            assembler: AssemblerOptions::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Build assembler options from string settings, as parsed off the
/// command line or environment.
///
/// Recognised keys: `max_block_weight`, `max_block_size`,
/// `min_tx_fee_per_kb` (decimal EMBER), `block_version` (regtest only),
/// `print_priority`.
///
/// When only a weight is given, the size bound is released; when only a
/// size is given, the weight follows it at the witness scale factor. Both
/// given restricts both.
pub fn assembler_options_from_settings(
    settings: &HashMap<String, String>,
    network: NetworkType,
) -> Result<AssemblerOptions, MinerError> {
    let mut options = AssemblerOptions { network, ..AssemblerOptions::default() };

    let mut weight_set = false;
    if let Some(value) = settings.get("max_block_weight") {
        options.max_weight = parse_u64(value)?;
        options.max_size = MAX_BLOCK_SERIALIZED_SIZE;
        weight_set = true;
    }
    if let Some(value) = settings.get("max_block_size") {
        options.max_size = parse_u64(value)?;
        if !weight_set {
            options.max_weight = options.max_size.saturating_mul(WITNESS_SCALE_FACTOR);
        }
    }
    if let Some(value) = settings.get("min_tx_fee_per_kb") {
        options.min_fee_rate = FeeRate::per_kb(parse_money(value)?);
    }
    if let Some(value) = settings.get("block_version") {
        if network.mine_blocks_on_demand() {
            options.block_version = Some(
                value.parse().map_err(|_| MinerError::InvalidAmount(value.clone()))?,
            );
        }
    }
    if let Some(value) = settings.get("print_priority") {
        options.print_priority = matches!(value.as_str(), "1" | "true");
    }

    Ok(options)
}

fn parse_u64(value: &str) -> Result<u64, MinerError> {
    value.parse().map_err(|_| MinerError::InvalidAmount(value.into()))
}
