//! Per-network chain parameters: genesis, activation heights, PoW limits

use crate::block::BlockHeader;
use crate::constants::*;
use crate::pow::compact_to_target;
use crate::script::*;
use crate::types::Uint256;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet3,
    Regtest,
}

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub magic: [u8; 4],
    pub default_port: u16,
    pub genesis_header: BlockHeader,
    pub genesis_hash: Uint256,
    pub pow_limit_bits: u32,
    pub pow_limit: U256,
    /// Testnet 20-minute rule
    pub allow_min_difficulty: bool,
    pub no_retargeting: bool,
    pub bip34_height: u32,
    pub bip65_height: u32,
    pub bip66_height: u32,
    pub csv_height: u32,
    pub segwit_height: u32,
    /// Heights [start, end) where blocks must signal segwit (BIP91)
    pub bip91_window: Option<(u32, u32)>,
    pub coinbase_maturity: u32,
    pub halving_interval: u32,
    /// Block weight limit doubles from this height when set
    pub s2x_height: Option<u32>,
    pub dns_seeds: &'static [&'static str],
}

fn header_from_hex(s: &str) -> BlockHeader {
    let raw = hex::decode(s).unwrap_or_default();
    BlockHeader::parse(&raw).unwrap_or_default()
}

fn limit(bits: u32) -> U256 {
    compact_to_target(bits).unwrap_or_else(U256::zero)
}

impl ChainParams {
    pub fn mainnet() -> Self {
        let genesis = header_from_hex(
            "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c",
        );
        ChainParams {
            network: Network::Mainnet,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
            genesis_hash: genesis.hash(),
            genesis_header: genesis,
            pow_limit_bits: MAX_TARGET,
            pow_limit: limit(MAX_TARGET),
            allow_min_difficulty: false,
            no_retargeting: false,
            bip34_height: 227_931,
            bip65_height: 388_381,
            bip66_height: 363_725,
            csv_height: 419_328,
            segwit_height: 481_824,
            bip91_window: Some((477_120, 481_824 - DIFFICULTY_ADJUSTMENT_INTERVAL)),
            coinbase_maturity: COINBASE_MATURITY,
            halving_interval: 210_000,
            s2x_height: None,
            dns_seeds: &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "seed.bitcoinstats.com",
                "seed.bitcoin.jonasschnelli.ch",
            ],
        }
    }

    pub fn testnet3() -> Self {
        let genesis = header_from_hex(
            "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff001d1aa4ae18",
        );
        ChainParams {
            network: Network::Testnet3,
            magic: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
            genesis_hash: genesis.hash(),
            genesis_header: genesis,
            pow_limit_bits: MAX_TARGET,
            pow_limit: limit(MAX_TARGET),
            allow_min_difficulty: true,
            no_retargeting: false,
            bip34_height: 21_111,
            bip65_height: 581_885,
            bip66_height: 330_776,
            csv_height: 770_112,
            segwit_height: 834_624,
            bip91_window: None,
            coinbase_maturity: COINBASE_MATURITY,
            halving_interval: 210_000,
            s2x_height: None,
            dns_seeds: &["testnet-seed.bitcoin.jonasschnelli.ch", "seed.tbtc.petertodd.org"],
        }
    }

    /// Local test network: trivial proof of work, everything active from height 1
    pub fn regtest() -> Self {
        let genesis = header_from_hex(
            "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000",
        );
        ChainParams {
            network: Network::Regtest,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
            genesis_hash: genesis.hash(),
            genesis_header: genesis,
            pow_limit_bits: 0x207f_ffff,
            pow_limit: limit(0x207f_ffff),
            allow_min_difficulty: true,
            no_retargeting: true,
            bip34_height: 1,
            bip65_height: 1,
            bip66_height: 1,
            csv_height: 1,
            segwit_height: 1,
            bip91_window: None,
            coinbase_maturity: COINBASE_MATURITY,
            halving_interval: 150,
            s2x_height: None,
            dns_seeds: &[],
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet3 => Self::testnet3(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Script verification flags for a block at (height, time)
    pub fn verify_flags(&self, height: u32, time: u32) -> u32 {
        let mut flags = VERIFY_NONE;
        if time >= P2SH_ACTIVATION_TIME {
            flags |= VERIFY_P2SH;
        }
        if height >= self.bip66_height {
            flags |= VERIFY_DERSIG;
        }
        if height >= self.bip65_height {
            flags |= VERIFY_CHECKLOCKTIMEVERIFY;
        }
        if height >= self.csv_height {
            flags |= VERIFY_CHECKSEQUENCEVERIFY;
        }
        if height >= self.segwit_height {
            flags |= VERIFY_WITNESS | VERIFY_NULLDUMMY;
        }
        flags
    }

    /// Lowest block version accepted at `height`
    pub fn min_block_version(&self, height: u32) -> i32 {
        if height >= self.bip65_height {
            4
        } else if height >= self.bip66_height {
            3
        } else if height >= self.bip34_height {
            2
        } else {
            1
        }
    }

    /// BIP91: inside the window a block must signal bit 1 with version bits
    pub fn bip91_violation(&self, height: u32, version: i32) -> bool {
        match self.bip91_window {
            Some((start, end)) if height >= start && height < end => {
                (version as u32) & 0xE000_0002 != 0x2000_0002
            }
            _ => false,
        }
    }

    pub fn max_block_weight(&self, height: u32) -> u64 {
        match self.s2x_height {
            Some(h) if height >= h => 2 * MAX_BLOCK_WEIGHT,
            _ => MAX_BLOCK_WEIGHT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes() {
        assert_eq!(
            ChainParams::mainnet().genesis_hash.to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(
            ChainParams::testnet3().genesis_hash.to_hex(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
        assert_eq!(
            ChainParams::regtest().genesis_hash.to_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_verify_flags_by_height() {
        let p = ChainParams::mainnet();
        let early = p.verify_flags(100, 1_300_000_000);
        assert_eq!(early, VERIFY_NONE);
        let flags = p.verify_flags(p.segwit_height, 1_600_000_000);
        assert_ne!(flags & VERIFY_P2SH, 0);
        assert_ne!(flags & VERIFY_WITNESS, 0);
        assert_ne!(flags & VERIFY_NULLDUMMY, 0);
        assert_eq!(p.verify_flags(p.csv_height - 1, 1_600_000_000) & VERIFY_CHECKSEQUENCEVERIFY, 0);
    }

    #[test]
    fn test_version_gating_and_bip91() {
        let p = ChainParams::mainnet();
        assert_eq!(p.min_block_version(p.bip34_height - 1), 1);
        assert_eq!(p.min_block_version(p.bip34_height), 2);
        assert_eq!(p.min_block_version(p.bip66_height), 3);
        assert_eq!(p.min_block_version(p.bip65_height), 4);

        assert!(p.bip91_violation(477_120, 0x2000_0000));
        assert!(!p.bip91_violation(477_120, 0x2000_0002));
        assert!(!p.bip91_violation(477_119, 0x2000_0000));
        assert!(!p.bip91_violation(p.segwit_height, 0x2000_0000));
    }
}
