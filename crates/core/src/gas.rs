//! Gas usage reporting
//!
//! Purely observational: nothing recorded here feeds back into a build.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

/// Gas reporter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasReporterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Display unit for costs, e.g. "USD" or "CNY"
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Price of one native token in `currency`; costs are omitted without it
    #[serde(default)]
    pub token_price: Option<f64>,
    /// Gas price in wei used for costs, overriding the network default
    #[serde(default)]
    pub gas_price: Option<u64>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for GasReporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            currency: default_currency(),
            token_price: None,
            gas_price: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GasStats {
    calls: u64,
    total: u128,
    min: u64,
    max: u64,
}

/// Aggregated gas figures for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasRow {
    pub key: String,
    pub calls: u64,
    pub min: u64,
    pub max: u64,
    pub avg: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_cost: Option<f64>,
}

/// Additive gas usage sink, a no-op when disabled
#[derive(Debug, Default)]
pub struct GasReporter {
    config: GasReporterConfig,
    stats: Mutex<BTreeMap<String, GasStats>>,
}

impl GasReporter {
    pub fn new(config: GasReporterConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(GasReporterConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn currency(&self) -> &str {
        &self.config.currency
    }

    pub fn record(&self, unit: &str, gas_used: u64) {
        if !self.config.enabled {
            return;
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats
            .entry(unit.to_string())
            .and_modify(|s| {
                s.calls += 1;
                s.total += u128::from(gas_used);
                s.min = s.min.min(gas_used);
                s.max = s.max.max(gas_used);
            })
            .or_insert(GasStats {
                calls: 1,
                total: u128::from(gas_used),
                min: gas_used,
                max: gas_used,
            });
    }

    /// Rows ordered by key; `network_gas_price` is used when no override is configured
    pub fn rows(&self, network_gas_price: Option<u64>) -> Vec<GasRow> {
        let gas_price = self.config.gas_price.or(network_gas_price);
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        stats
            .iter()
            .map(|(key, s)| {
                let avg = (s.total / u128::from(s.calls)) as u64;
                GasRow {
                    key: key.clone(),
                    calls: s.calls,
                    min: s.min,
                    max: s.max,
                    avg,
                    avg_cost: cost(avg, gas_price, self.config.token_price),
                }
            })
            .collect()
    }

    /// Plain-text table of the recorded figures
    pub fn render(&self, network_gas_price: Option<u64>) -> String {
        let rows = self.rows(network_gas_price);
        let mut out = String::new();
        if rows.is_empty() {
            return out;
        }

        let width = rows.iter().map(|r| r.key.len()).max().unwrap_or(0).max(8);
        let _ = writeln!(
            out,
            "{:<width$}  {:>6}  {:>10}  {:>10}  {:>10}  {:>12}",
            "Contract",
            "Calls",
            "Min",
            "Max",
            "Avg",
            format!("{} (avg)", self.config.currency),
        );
        for row in rows {
            let cost = row
                .avg_cost
                .map(|c| format!("{c:.2}"))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<width$}  {:>6}  {:>10}  {:>10}  {:>10}  {:>12}",
                row.key, row.calls, row.min, row.max, row.avg, cost,
            );
        }
        out
    }
}

/// gas * price (wei) in native tokens, times the token price
fn cost(gas: u64, gas_price: Option<u64>, token_price: Option<f64>) -> Option<f64> {
    let wei = u128::from(gas) * u128::from(gas_price?);
    Some(wei as f64 / 1e18 * token_price?)
}

/// Rough gas needed to deploy contract creation code
///
/// Transaction base cost, contract creation surcharge, calldata cost for
/// the creation code and the code deposit cost for the runtime code.
pub fn estimate_deployment_gas(creation_code: &[u8], runtime_size: usize) -> u64 {
    const TX_BASE: u64 = 21_000;
    const CREATE: u64 = 32_000;
    const ZERO_BYTE: u64 = 4;
    const NONZERO_BYTE: u64 = 16;
    const CODE_DEPOSIT_PER_BYTE: u64 = 200;

    let calldata: u64 = creation_code
        .iter()
        .map(|&b| if b == 0 { ZERO_BYTE } else { NONZERO_BYTE })
        .sum();

    TX_BASE + CREATE + calldata + CODE_DEPOSIT_PER_BYTE * runtime_size as u64
}
