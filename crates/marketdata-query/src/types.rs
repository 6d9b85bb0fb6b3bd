//! Query request and result types.

use marketdata_core::{CacheStrategy, Market, Payload};
use serde::{Deserialize, Serialize};

/// Kind of query, used to pick a default cache strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    /// Analytical lookup of a symbol list; tolerates slightly stale data.
    #[default]
    BySymbols,
    /// Low-latency lookup; prefers fresh data.
    Realtime,
}

/// Field projection applied to each result payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Keep only these top-level fields. Empty keeps everything.
    pub include_fields: Vec<String>,
    /// Drop these top-level fields.
    pub exclude_fields: Vec<String>,
}

/// A batched symbol query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Raw symbols, in the order results should come back.
    pub symbols: Vec<String>,
    /// Query kind.
    pub query_type: QueryType,
    /// Forces every symbol into this market instead of inferring it.
    pub market: Option<Market>,
    /// Preferred upstream provider.
    pub provider: Option<String>,
    /// Receiver capability; the pipeline default when unset.
    pub receiver_type: Option<String>,
    /// Cache strategy; derived from `query_type` when unset.
    pub strategy: Option<CacheStrategy>,
    /// Field projection.
    pub options: QueryOptions,
    /// 1-based page number.
    pub page: Option<usize>,
    /// Page size.
    pub limit: Option<usize>,
    /// Volatility hint for the adaptive strategy.
    pub volatility: Option<f64>,
}

impl QueryRequest {
    /// Query for `symbols` with every other field defaulted.
    #[must_use]
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Sets the query type.
    #[must_use]
    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    /// Sets the cache strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Forces the market.
    #[must_use]
    pub fn with_market(mut self, market: Market) -> Self {
        self.market = Some(market);
        self
    }

    /// Sets the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the receiver capability.
    #[must_use]
    pub fn with_receiver_type(mut self, receiver_type: impl Into<String>) -> Self {
        self.receiver_type = Some(receiver_type.into());
        self
    }

    /// Sets the field projection.
    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Requests one page of results.
    #[must_use]
    pub fn with_page(mut self, page: usize, limit: usize) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }
}

/// Where a result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    /// Served from the smart cache.
    Cache,
    /// Fetched from the upstream receiver.
    Realtime,
}

/// Data for one symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolDataResult {
    /// Normalized symbol.
    pub symbol: String,
    /// Payload after projection.
    pub data: Payload,
    /// Origin of the payload.
    pub source: DataSource,
}

/// Failure for one symbol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryErrorInfo {
    /// Symbol as given, or normalized once validated.
    pub symbol: String,
    /// Human-readable reason.
    pub reason: String,
}

impl QueryErrorInfo {
    pub(crate) fn new(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }
}

/// Hit and miss counters for one source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitMiss {
    /// Symbols served.
    pub hits: usize,
    /// Symbols not served.
    pub misses: usize,
}

/// Per-source counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSources {
    /// Cache lookups.
    pub cache: HitMiss,
    /// Upstream fetches, including shard timeouts as misses.
    pub realtime: HitMiss,
}

/// Page metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// 1-based page number.
    pub page: usize,
    /// Page size.
    pub limit: usize,
    /// Results before paging.
    pub total: usize,
    /// Number of pages.
    pub total_pages: usize,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_prev: bool,
}

impl Pagination {
    pub(crate) fn new(page: usize, limit: usize, total: usize) -> Self {
        let page = page.max(1);
        let limit = limit.max(1);
        let total_pages = total.div_ceil(limit);
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }

    /// Index range of this page within `total` results.
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = (self.page - 1).saturating_mul(self.limit).min(self.total);
        let end = start.saturating_add(self.limit).min(self.total);
        start..end
    }
}

/// Outcome of one batched query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryExecutionResult {
    /// Query identifier.
    pub query_id: String,
    /// Results in request order, projected and paged.
    pub results: Vec<SymbolDataResult>,
    /// True if any symbol was served from cache.
    pub cache_used: bool,
    /// Per-source counters.
    pub data_sources: DataSources,
    /// Per-symbol failures in request order.
    pub errors: Vec<QueryErrorInfo>,
    /// Page metadata when paging was requested.
    pub pagination: Option<Pagination>,
}
