//! Two-level sharding of a market's symbols.

use std::fmt;
use std::ops::Range;

use marketdata_core::Market;

/// Position of a receiver batch inside a query, for spans and error reasons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryBatchContext {
    /// Query identifier.
    pub query_id: String,
    /// Market of the shard.
    pub market: Market,
    /// Index of the market chunk.
    pub chunk_index: usize,
    /// Index of the receiver batch within its chunk, if at that level.
    pub receiver_batch_index: Option<usize>,
}

impl QueryBatchContext {
    /// Context for a market-level shard.
    #[must_use]
    pub fn market(query_id: impl Into<String>, market: Market) -> Self {
        Self {
            query_id: query_id.into(),
            market,
            chunk_index: 0,
            receiver_batch_index: None,
        }
    }

    /// Context for one chunk of this market.
    #[must_use]
    pub fn chunk(&self, chunk_index: usize) -> Self {
        Self {
            chunk_index,
            receiver_batch_index: None,
            ..self.clone()
        }
    }

    /// Context for one receiver batch of this chunk.
    #[must_use]
    pub fn receiver_batch(&self, receiver_batch_index: usize) -> Self {
        Self {
            receiver_batch_index: Some(receiver_batch_index),
            ..self.clone()
        }
    }
}

impl fmt::Display for QueryBatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "market={} chunk={}", self.market, self.chunk_index)?;
        if let Some(batch) = self.receiver_batch_index {
            write!(f, " batch={batch}")?;
        }
        Ok(())
    }
}

/// Splits `range` into consecutive ranges of at most `size`.
///
/// A `size` of zero is treated as one.
#[must_use]
pub fn split(range: Range<usize>, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    range
        .clone()
        .step_by(size)
        .map(|start| start..(start + size).min(range.end))
        .collect()
}

/// Splits `len` symbols into market chunks, then each chunk into receiver
/// batches, as index ranges into the market's symbol list.
#[must_use]
pub fn plan(len: usize, chunk_size: usize, batch_size: usize) -> Vec<Vec<Range<usize>>> {
    split(0..len, chunk_size)
        .into_iter()
        .map(|chunk| split(chunk, batch_size))
        .collect()
}

/// The range covered by a chunk's receiver batches.
#[must_use]
pub fn span(batches: &[Range<usize>]) -> Range<usize> {
    match (batches.first(), batches.last()) {
        (Some(first), Some(last)) => first.start..last.end,
        _ => 0..0,
    }
}
