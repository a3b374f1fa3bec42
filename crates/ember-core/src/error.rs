//! Error types for the Ember protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("value overflow")] ValueOverflow,
    #[error("coinbase data too large: {size} > {max}")] OversizedCoinbaseData { size: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block has no transactions")] Empty,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("oversized: {size} > {max}")] OversizedBlock { size: u64, max: u64 },
    #[error("overweight: {weight} > {max}")] OverweightBlock { weight: u64, max: u64 },
    #[error("witness commitment missing")] MissingWitnessCommitment,
    #[error("witness commitment mismatch")] WitnessCommitmentMismatch,
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TxError },
}

impl BlockError {
    /// Whether this failure can be explained by corrupted reconstruction
    /// input (a short-ID collision) rather than an invalid block.
    pub fn corruption_possible(&self) -> bool {
        matches!(self, Self::InvalidMerkleRoot)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error("unknown pool entry: {0}")] UnknownEntry(String),
    #[error("too many unconfirmed ancestors [limit: {limit}]")] TooManyAncestors { limit: u64 },
    #[error("exceeds ancestor size limit [limit: {limit}]")] ExceedsAncestorSize { limit: u64 },
    #[error("too many descendants for tx {txid} [limit: {limit}]")] TooManyDescendants { txid: String, limit: u64 },
    #[error("exceeds descendant size limit for tx {txid} [limit: {limit}]")] ExceedsDescendantSize { txid: String, limit: u64 },
    #[error("mempool full: could not trim to target")] TrimFailed,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MinerError {
    #[error("assembled template failed validity: {0}")] TemplateInvalid(BlockError),
    #[error("coinbase data too large: {size} > {max}")] CoinbaseDataTooLarge { size: usize, max: usize },
    #[error("template transaction missing from pool: {0}")] MissingPoolEntry(String),
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("serialization: {0}")] Serialization(String),
}

/// Outcome classes for compact-block processing, per the relay contract:
/// `Invalid` means the peer sent garbage, `Failed` means a transient
/// distribution outcome that a broader request can recover from.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("malformed compact block")] Invalid,
    #[error("reconstruction failed, full request required")] Failed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimatorError {
    #[error("fee estimate file requires version {required}, ours is {ours}")] UpVersion { required: u32, ours: u32 },
    #[error("corrupt fee estimate data: {0}")] Corrupt(String),
}

#[derive(Error, Debug)]
pub enum EmberError {
    #[error(transparent)] Tx(#[from] TxError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Miner(#[from] MinerError),
    #[error(transparent)] Read(#[from] ReadError),
    #[error(transparent)] Estimator(#[from] EstimatorError),
}
