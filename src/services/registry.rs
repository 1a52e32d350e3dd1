//! Asset and trading-pair registry.
//!
//! The single source for pair lookup and order-parameter validation. Assets
//! and pairs are registered at startup from config; only the `active` flag
//! changes afterwards.

use dashmap::DashMap;

use crate::models::{Asset, TradingPair};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("pair already registered: {0}")]
    DuplicatePair(String),
}

pub struct Registry {
    assets: DashMap<String, Asset>,
    pairs: DashMap<String, TradingPair>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            assets: DashMap::new(),
            pairs: DashMap::new(),
        }
    }

    pub fn register_asset(&self, asset: Asset) {
        self.assets.insert(asset.symbol.clone(), asset);
    }

    /// Both legs must already be registered.
    pub fn register_pair(&self, pair: TradingPair) -> Result<(), RegistryError> {
        if !self.assets.contains_key(&pair.base) {
            return Err(RegistryError::UnknownAsset(pair.base.clone()));
        }
        if !self.assets.contains_key(&pair.quote) {
            return Err(RegistryError::UnknownAsset(pair.quote.clone()));
        }
        if self.pairs.contains_key(&pair.symbol) {
            return Err(RegistryError::DuplicatePair(pair.symbol.clone()));
        }
        self.pairs.insert(pair.symbol.clone(), pair);
        Ok(())
    }

    pub fn asset(&self, symbol: &str) -> Option<Asset> {
        self.assets.get(symbol).map(|a| a.clone())
    }

    pub fn pair(&self, symbol: &str) -> Option<TradingPair> {
        self.pairs.get(symbol).map(|p| p.clone())
    }

    pub fn pairs(&self) -> Vec<TradingPair> {
        self.pairs.iter().map(|p| p.clone()).collect()
    }

    pub fn set_pair_active(&self, symbol: &str, active: bool) -> bool {
        match self.pairs.get_mut(symbol) {
            Some(mut pair) => {
                pair.active = active;
                true
            }
            None => false,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
