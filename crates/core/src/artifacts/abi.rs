//! ABI helpers: canonical signatures and selectors

use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

/// Solidity ABI represented as JSON values
pub type Abi = Vec<Value>;

/// Entries of the given ABI type (`function`, `event`, `error`, ...)
pub fn entries<'a>(abi: &'a Abi, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    abi.iter().filter(move |e| e["type"] == kind)
}

/// Canonical signature such as `transfer(address,uint256)`
///
/// Tuples are expanded into their component types, as required for
/// selector computation.
pub fn signature(entry: &Value) -> Option<String> {
    let name = entry["name"].as_str()?;
    let inputs = entry["inputs"]
        .as_array()
        .map(|params| params.iter().map(canonical_type).collect::<Vec<_>>())
        .unwrap_or_default();
    Some(format!("{}({})", name, inputs.join(",")))
}

/// Canonical type of one parameter
pub fn canonical_type(param: &Value) -> String {
    let ty = param["type"].as_str().unwrap_or_default();
    match ty.strip_prefix("tuple") {
        Some(suffix) => {
            let components = param["components"]
                .as_array()
                .map(|c| c.iter().map(canonical_type).collect::<Vec<_>>())
                .unwrap_or_default();
            format!("({}){}", components.join(","), suffix)
        }
        None => ty.to_string(),
    }
}

/// 4-byte function selector of a canonical signature, `0x`-prefixed
pub fn selector(signature: &str) -> String {
    let hash = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(&hash[..4]))
}

/// Full 32-byte event topic of a canonical signature, `0x`-prefixed
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// Map of function signature to selector
pub fn function_selectors(abi: &Abi) -> BTreeMap<String, String> {
    entries(abi, "function")
        .filter_map(signature)
        .map(|sig| {
            let sel = selector(&sig);
            (sig, sel)
        })
        .collect()
}
