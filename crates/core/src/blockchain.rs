//! Network targets and deployed-bytecode checks

use crate::error::{BuildError, BuildResult};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTarget {
    /// Network name (e.g., "bsc_mainnet", "bsc_testnet", "local")
    pub name: String,
    /// RPC endpoint URL
    pub url: String,
    /// Chain ID
    pub chain_id: u64,
    /// Default gas price in wei
    pub gas_price: u64,
}

impl NetworkTarget {
    /// Local development node
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            url: "http://localhost:8545".to_string(),
            chain_id: 1337,
            gas_price: 1_000_000_000,
        }
    }

    pub fn custom(
        name: impl Into<String>,
        url: impl Into<String>,
        chain_id: u64,
        gas_price: u64,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            chain_id,
            gas_price,
        }
    }
}

/// Static table of network targets, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    targets: BTreeMap<String, NetworkTarget>,
    default_network: Option<String>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: impl IntoIterator<Item = NetworkTarget>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.name.clone(), t)).collect(),
            default_network: None,
        }
    }

    pub fn get(&self, name: &str) -> BuildResult<&NetworkTarget> {
        self.targets
            .get(name)
            .ok_or_else(|| BuildError::UnknownNetwork(name.to_string()))
    }

    /// Network used when none is named explicitly
    pub fn set_default(&mut self, name: &str) -> BuildResult<()> {
        self.get(name)?;
        self.default_network = Some(name.to_string());
        Ok(())
    }

    /// Look up `name`, or the default network when `name` is `None`
    pub fn resolve(&self, name: Option<&str>) -> BuildResult<&NetworkTarget> {
        match name.or(self.default_network.as_deref()) {
            Some(name) => self.get(name),
            None => Err(BuildError::UnknownNetwork("<default>".to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkTarget> {
        self.targets.values()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Outcome of comparing compiled runtime code with code found on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BytecodeMatch {
    /// Byte-for-byte identical
    Exact,
    /// Identical once the trailing compiler metadata is removed
    IgnoringMetadata,
    Mismatch { expected: String, actual: String },
}

impl BytecodeMatch {
    pub fn is_match(&self) -> bool {
        !matches!(self, BytecodeMatch::Mismatch { .. })
    }
}

/// Compare compiled runtime code against deployed code
pub fn compare_bytecode(compiled: &[u8], deployed: &[u8]) -> BytecodeMatch {
    if compiled == deployed {
        return BytecodeMatch::Exact;
    }
    if strip_metadata(compiled) == strip_metadata(deployed) {
        return BytecodeMatch::IgnoringMetadata;
    }
    BytecodeMatch::Mismatch {
        expected: format!("0x{}", utils::hash_bytes(compiled)),
        actual: format!("0x{}", utils::hash_bytes(deployed)),
    }
}

/// Drop the CBOR metadata trailer solc appends to runtime code
///
/// The last two bytes hold the big-endian length of the CBOR blob that
/// precedes them; the blob itself is a CBOR map. Code without such a
/// trailer is returned unchanged.
pub fn strip_metadata(code: &[u8]) -> &[u8] {
    let Some(len_bytes) = code.len().checked_sub(2).map(|at| &code[at..]) else {
        return code;
    };
    let cbor_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    match code.len().checked_sub(cbor_len + 2) {
        // CBOR major type 5 (map): 0xa0..=0xbf
        Some(end) if cbor_len > 0 && (0xa0..=0xbf).contains(&code[end]) => &code[..end],
        _ => code,
    }
}

#[cfg(feature = "ethers")]
pub mod ethers {
    use super::*;
    use crate::artifacts::CompiledContract;
    use ::ethers::{
        providers::{Http, Middleware, Provider},
        types::Address,
    };
    use eyre::{Context, Result};

    /// Fetch deployed runtime code, checking the node serves the expected chain
    pub async fn fetch_deployed_code(target: &NetworkTarget, address: &str) -> Result<Vec<u8>> {
        let provider =
            Provider::<Http>::try_from(target.url.as_str()).context("Failed to create provider")?;

        let chain_id = provider
            .get_chainid()
            .await
            .context("Failed to get chain ID")?;

        if chain_id.as_u64() != target.chain_id {
            return Err(eyre::eyre!(
                "Chain ID mismatch on {}: expected {}, got {}",
                target.name,
                target.chain_id,
                chain_id
            ));
        }

        let address: Address = address.parse().context("Invalid contract address")?;
        let code = provider
            .get_code(address, None)
            .await
            .context("Failed to fetch contract bytecode")?;

        if code.is_empty() {
            return Err(eyre::eyre!("No bytecode found at address {:?}", address));
        }

        Ok(code.to_vec())
    }

    /// Compare a compiled contract with the code deployed at `address`
    pub async fn verify_deployed(
        target: &NetworkTarget,
        address: &str,
        contract: &CompiledContract,
    ) -> Result<BytecodeMatch> {
        let compiled = contract
            .deployed_bytecode
            .to_bytes()
            .context("Compiled runtime code is not linked")?;
        let deployed = fetch_deployed_code(target, address).await?;
        Ok(compare_bytecode(&compiled, &deployed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NetworkRegistry {
        NetworkRegistry::from_targets([
            NetworkTarget::custom(
                "bsc_testnet",
                "https://data-seed-prebsc-1-s1.binance.org:8545",
                97,
                20_000_000_000,
            ),
            NetworkTarget::custom("bsc_mainnet", "https://bsc-dataseed.binance.org/", 56, 20_000_000_000),
        ])
    }

    #[test]
    fn test_lookup() {
        let networks = registry();
        assert_eq!(networks.get("bsc_mainnet").unwrap().chain_id, 56);
        assert!(matches!(
            networks.get("ropsten"),
            Err(BuildError::UnknownNetwork(name)) if name == "ropsten"
        ));
        assert_eq!(NetworkTarget::local().chain_id, 1337);
    }

    #[test]
    fn test_default_network() {
        let mut networks = registry();
        assert!(networks.resolve(None).is_err());

        networks.set_default("bsc_testnet").unwrap();
        assert_eq!(networks.resolve(None).unwrap().chain_id, 97);
        assert_eq!(networks.resolve(Some("bsc_mainnet")).unwrap().chain_id, 56);
        assert!(networks.set_default("nowhere").is_err());
    }

    #[test]
    fn test_strip_metadata() {
        // code: 60 80, metadata: a1 65, length 00 02
        let code = [0x60, 0x80, 0xa1, 0x65, 0x00, 0x02];
        assert_eq!(strip_metadata(&code), &[0x60, 0x80]);

        // declared length longer than the code leaves it untouched
        let short = [0x60, 0xff, 0xff];
        assert_eq!(strip_metadata(&short), &short);
        assert_eq!(strip_metadata(&[0x00]), &[0x00]);

        // a small trailing length without a CBOR map in front is plain code
        let plain = [0x60, 0x01, 0x00, 0x01];
        assert_eq!(strip_metadata(&plain), &plain);
    }

    #[test]
    fn test_compare_bytecode() {
        let compiled = [0x60, 0x80, 0xa1, 0x65, 0x00, 0x02];
        let redeployed = [0x60, 0x80, 0xa1, 0x66, 0x00, 0x02];
        let other = [0x60, 0x40, 0xa1, 0x65, 0x00, 0x02];

        assert_eq!(compare_bytecode(&compiled, &compiled), BytecodeMatch::Exact);
        assert_eq!(compare_bytecode(&compiled, &redeployed), BytecodeMatch::IgnoringMetadata);
        assert!(!compare_bytecode(&compiled, &other).is_match());
    }
}
