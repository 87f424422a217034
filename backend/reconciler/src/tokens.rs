//! Whitelisted tokens and their dust cutoffs.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::amount::Amount;
use crate::errors::{ReconcileError, Result};

/// Amounts are normalised to 18 decimals on chain.
const BASE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub symbol: String,
    pub foreign_address: String,
    pub decimals: u32,
}

impl TokenInfo {
    /// Smallest meaningful amount: `10^(18 - decimals)`.
    pub fn cutoff(&self) -> Amount {
        Amount::pow10(BASE_DECIMALS - self.decimals)
    }

    pub fn is_below_cutoff(&self, amount: &Amount) -> bool {
        amount < &self.cutoff()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    by_symbol: HashMap<String, TokenInfo>,
    by_address: HashMap<String, String>,
}

impl TokenRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let registry = Self::from_json(&raw)?;
        if registry.is_empty() {
            return Err(ReconcileError::Config(format!(
                "token whitelist {} lists no tokens",
                path.display()
            )));
        }
        Ok(registry)
    }

    /// Accepts either a bare array or `{ "tokenWhitelist": [...] }`.
    pub fn from_json(raw: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Wrapped {
                #[serde(rename = "tokenWhitelist")]
                token_whitelist: Vec<TokenInfo>,
            },
            Bare(Vec<TokenInfo>),
        }

        let tokens = match serde_json::from_str::<Shape>(raw)? {
            Shape::Wrapped { token_whitelist } => token_whitelist,
            Shape::Bare(list) => list,
        };
        Self::new(tokens)
    }

    pub fn new(tokens: Vec<TokenInfo>) -> Result<Self> {
        let mut registry = Self::default();
        for token in tokens {
            if token.decimals > BASE_DECIMALS {
                return Err(ReconcileError::Config(format!(
                    "token {} has {} decimals, more than {BASE_DECIMALS}",
                    token.symbol, token.decimals
                )));
            }
            registry
                .by_address
                .insert(token.foreign_address.to_lowercase(), token.symbol.clone());
            registry.by_symbol.insert(token.symbol.clone(), token);
        }
        Ok(registry)
    }

    pub fn by_address(&self, address: &str) -> Result<&TokenInfo> {
        self.by_address
            .get(&address.to_lowercase())
            .and_then(|symbol| self.by_symbol.get(symbol))
            .ok_or_else(|| ReconcileError::MissingToken(format!("address {address}")))
    }

    pub fn by_symbol(&self, symbol: &str) -> Result<&TokenInfo> {
        self.by_symbol
            .get(symbol)
            .ok_or_else(|| ReconcileError::MissingToken(format!("symbol {symbol}")))
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
