//! Bitcoin network definitions and constants.

use std::str::FromStr;

/// Bitcoin network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Bitcoin mainnet
    #[default]
    Mainnet,
    /// Bitcoin testnet3
    Testnet,
    /// Bitcoin testnet4
    Testnet4,
    /// Default signet
    Signet,
    /// Local regression test network
    Regtest,
}

impl Network {
    /// Get the Bech32 human-readable part for this network.
    pub fn bech32_hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bc",
            Network::Testnet | Network::Testnet4 | Network::Signet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    /// Get the version byte for P2PKH addresses.
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            _ => 0x6f,
        }
    }

    /// Get the version byte for P2SH addresses.
    pub fn p2sh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x05,
            _ => 0xc4,
        }
    }

    /// Get the default RPC port for this network.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Testnet4 => 48332,
            Network::Signet => 38332,
            Network::Regtest => 18443,
        }
    }

    /// Whether a configured difficulty override may change the mining target.
    ///
    /// Every network other than regtest is treated as production: a block
    /// mined against a relaxed target there would be rejected anyway.
    pub fn allows_difficulty_override(&self) -> bool {
        matches!(self, Network::Regtest)
    }

    /// Parse the `chain` field of `getblockchaininfo`.
    pub fn from_chain_name(chain: &str) -> Option<Self> {
        match chain {
            "main" => Some(Network::Mainnet),
            "test" => Some(Network::Testnet),
            "testnet4" => Some(Network::Testnet4),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    /// Get network name as string.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Testnet4 => "testnet4",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "testnet3" | "test" => Ok(Network::Testnet),
            "testnet4" => Ok(Network::Testnet4),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Byte offset of the timestamp within a serialized header.
pub const HEADER_TIME_OFFSET: usize = 68;

/// Byte offset of the nonce within a serialized header.
pub const HEADER_NONCE_OFFSET: usize = 76;

/// Version of the coinbase transactions we build.
pub const COINBASE_TX_VERSION: u32 = 2;

/// Maximum size of coinbase scriptSig.
pub const MAX_COINBASE_SCRIPTSIG_SIZE: usize = 100;

/// Minimum size of coinbase scriptSig (consensus rule).
pub const MIN_COINBASE_SCRIPTSIG_SIZE: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_str() {
        assert_eq!("mainnet".parse(), Ok(Network::Mainnet));
        assert_eq!("MAINNET".parse(), Ok(Network::Mainnet));
        assert_eq!("testnet4".parse(), Ok(Network::Testnet4));
        assert_eq!("regtest".parse(), Ok(Network::Regtest));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_from_chain_name() {
        assert_eq!(Network::from_chain_name("main"), Some(Network::Mainnet));
        assert_eq!(Network::from_chain_name("test"), Some(Network::Testnet));
        assert_eq!(Network::from_chain_name("regtest"), Some(Network::Regtest));
        assert_eq!(Network::from_chain_name("liquid"), None);
    }

    #[test]
    fn test_only_regtest_allows_difficulty_override() {
        assert!(Network::Regtest.allows_difficulty_override());
        for network in [
            Network::Mainnet,
            Network::Testnet,
            Network::Testnet4,
            Network::Signet,
        ] {
            assert!(!network.allows_difficulty_override(), "{}", network);
        }
    }
}
