//! The seam between the orchestrator and whatever supplies rosters and prices.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::planner::Window;
use crate::types::{Entity, PriceRow};

/// Remote source of the entity roster and per-symbol price history.
///
/// Implementations must be shareable across the fetch pool.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// The current roster, in source order. May contain duplicate symbols.
    async fn fetch_entity_roster(&self) -> Result<Vec<Entity>, FetchError>;

    /// Daily rows for `symbol` within `window`. An unknown symbol yields an
    /// empty vector, not an error.
    async fn fetch_prices(&self, symbol: &str, window: &Window)
        -> Result<Vec<PriceRow>, FetchError>;
}
