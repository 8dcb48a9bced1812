//! Bitcoin consensus, policy and protocol constants

/// Satoshis per BTC
pub const COIN: u64 = 100_000_000;

/// Maximum money supply: 21,000,000 BTC in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Maximum block weight (BIP141)
pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

/// Legacy serialized size limit, used for no-witness size checks
pub const MAX_BLOCK_BASE_SIZE: u64 = 1_000_000;

pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Maximum sigops cost per block
pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;

/// Default policy limit for a single transaction's serialized size
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum stack (plus alt-stack) size during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in script
pub const MAX_SCRIPT_OPS: usize = 201;

pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Initial block subsidy: 50 BTC
pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

/// Difficulty adjustment interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u32 = 2016;

/// Target time per block: 10 minutes
pub const TARGET_TIME_PER_BLOCK: u32 = 600;

/// Two weeks
pub const TARGET_TIMESPAN: u32 = DIFFICULTY_ADJUSTMENT_INTERVAL * TARGET_TIME_PER_BLOCK;

/// Mainnet proof-of-work limit in compact form
pub const MAX_TARGET: u32 = 0x1d00ffff;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Inputs with sequence >= this value do not signal RBF
pub const SEQUENCE_RBF: u32 = 0xfffffffe;

/// BIP68 relative lock time fields
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Blocks may not be stamped more than two hours ahead of local time
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Number of ancestors used for median-past-time
pub const MEDIAN_TIME_SPAN: usize = 11;

/// A new block may not be more than this many blocks below the tip
pub const MOVING_CHECKPOINT_DEPTH: u32 = 2016;

/// Mainnet coinbase maturity; per-network value lives in `ChainParams`
pub const COINBASE_MATURITY: u32 = 100;

/// BIP16 switch-over time
pub const P2SH_ACTIVATION_TIME: u32 = 1_333_238_400;

/// OP_RETURN push-36 followed by the witness commitment tag
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

// ----------------------------------------------------------------------------
// P2P protocol
// ----------------------------------------------------------------------------

pub const PROTOCOL_VERSION: u32 = 70015;
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
pub const SENDHEADERS_VERSION: u32 = 70012;
pub const FEEFILTER_VERSION: u32 = 70013;
pub const SHORT_IDS_BLOCKS_VERSION: u32 = 70014;

pub const NODE_NETWORK: u64 = 1;
pub const NODE_WITNESS: u64 = 1 << 3;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_CMPCT_BLOCK: u32 = 4;
pub const MSG_WITNESS_FLAG: u32 = 1 << 30;
pub const MSG_WITNESS_TX: u32 = MSG_TX | MSG_WITNESS_FLAG;
pub const MSG_WITNESS_BLOCK: u32 = MSG_BLOCK | MSG_WITNESS_FLAG;

pub const MAX_HEADERS_RESULTS: usize = 2000;
pub const MAX_BLOCKS_INV: usize = 500;
pub const MAX_INV_SIZE: usize = 50_000;
pub const MAX_ADDR_SIZE: usize = 1000;
pub const MAX_LOCATOR_SIZE: usize = 101;

/// Per-peer outgoing ring buffer
pub const SEND_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Cumulative misbehaviour score that triggers a ban
pub const MISBEHAVE_BAN_SCORE: u32 = 1000;

pub const HANDSHAKE_TIMEOUT_SECS: u64 = 20;
pub const VERSION_MSG_TIMEOUT_SECS: u64 = 20;
pub const GET_HEADERS_TIMEOUT_SECS: u64 = 120;
pub const BLOCK_IN_FLIGHT_TIMEOUT_SECS: u64 = 300;
pub const TICK_INTERVAL_MS: u64 = 100;
pub const PING_HISTORY_SIZE: usize = 8;
pub const INV_SEEN_WINDOW: usize = 2000;

// ----------------------------------------------------------------------------
// Block download
// ----------------------------------------------------------------------------

pub const MAX_PEERS_BLOCKS_IN_PROGRESS: usize = 500;
pub const MAX_GETDATA_FORWARD: u64 = 2 * 1024 * 1024;
pub const MAX_BLOCKS_FORWARD_COUNT: u32 = 5000;
pub const MAX_BLOCKS_FORWARD_SIZE: u64 = 500 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Mempool
// ----------------------------------------------------------------------------

/// Maximum number of transactions evicted by a single replacement
pub const MAX_RBF_REPLACEMENTS: usize = 100;

/// Sequence value at or above which an input is final (not replaceable)
pub const FINAL_SEQUENCE_THRESHOLD: u32 = SEQUENCE_RBF;
