//! Market price refresh for materialized products.
//!
//! Prices are a derived field: the refresh task overwrites them for every
//! product the indexer has materialized.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use crate::error::{JobError, StoreError};
use crate::scheduler::ScheduledJob;
use crate::store::RelationalStore;

/// Source of market prices.
pub trait PriceFeed: Send + Sync {
    fn quote(&self, product_id: &str) -> f64;
}

/// Simulated market: uniform prices in `[min, max)`.
#[derive(Debug, Clone, Copy)]
pub struct RandomPriceFeed {
    min: f64,
    max: f64,
}

impl RandomPriceFeed {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Default for RandomPriceFeed {
    fn default() -> Self {
        Self::new(10.0, 100.0)
    }
}

impl PriceFeed for RandomPriceFeed {
    fn quote(&self, _product_id: &str) -> f64 {
        rand::thread_rng().gen_range(self.min..self.max)
    }
}

pub struct PriceRefresher {
    store: Arc<dyn RelationalStore>,
    feed: Arc<dyn PriceFeed>,
}

impl PriceRefresher {
    pub fn new(store: Arc<dyn RelationalStore>, feed: Arc<dyn PriceFeed>) -> Self {
        Self { store, feed }
    }

    /// Reprice every product; returns how many rows changed.
    pub fn refresh(&self) -> Result<usize, StoreError> {
        let mut updated = 0;
        for id in self.store.product_ids()? {
            if self.store.update_price(&id, self.feed.quote(&id))? {
                updated += 1;
            }
        }
        info!(updated, "market prices refreshed");
        Ok(updated)
    }
}

#[async_trait]
impl ScheduledJob for PriceRefresher {
    fn name(&self) -> &str {
        "price-refresh"
    }

    async fn run(&self) -> Result<(), JobError> {
        self.refresh()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Entity, Producer, Product, SqliteStore};

    struct FixedFeed(f64);

    impl PriceFeed for FixedFeed {
        fn quote(&self, _product_id: &str) -> f64 {
            self.0
        }
    }

    fn seeded_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert(&Entity::Producer(Producer {
                id: "P1".into(),
                name: "Cooperative Souss".into(),
                region: "Souss-Massa".into(),
            }))
            .unwrap();
        for id in ["X1", "X2"] {
            store
                .insert(&Entity::Product(Product {
                    id: id.into(),
                    name: "Agrumes".into(),
                    producer_id: "P1".into(),
                    region: "Souss-Massa".into(),
                    harvested_at: 1_700_000_000,
                    organic: false,
                    market_price: None,
                }))
                .unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn refresh_updates_every_product() {
        let store = seeded_store();
        let refresher = PriceRefresher::new(store.clone(), Arc::new(FixedFeed(37.5)));
        assert_eq!(refresher.refresh().unwrap(), 2);
        assert_eq!(store.market_price("X1").unwrap(), Some(37.5));
        assert_eq!(store.market_price("X2").unwrap(), Some(37.5));
    }

    #[test]
    fn random_feed_stays_in_range() {
        let feed = RandomPriceFeed::default();
        for _ in 0..1000 {
            let p = feed.quote("X1");
            assert!((10.0..100.0).contains(&p));
        }
    }

    #[tokio::test]
    async fn job_runs_refresh() {
        let store = seeded_store();
        let job = PriceRefresher::new(store.clone(), Arc::new(FixedFeed(12.0)));
        job.run().await.unwrap();
        assert_eq!(store.market_price("X2").unwrap(), Some(12.0));
    }
}
