use super::engine::{ItemKey, StoreError, StoreResult, VersionedStore, WriteOp};
use super::item::StoredItem;
use futures::future::join_all;
use std::ops::Range;

/// Result of one chunk of a chunked call, tagged with the input positions it
/// covered.
#[derive(Debug)]
pub struct ChunkOutcome<T> {
    pub range: Range<usize>,
    pub result: StoreResult<T>,
}

impl<T> ChunkOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

fn ranges(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = chunk_size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

/// Issue `ops` as concurrent transactional writes of at most `chunk_size`
/// items each. Each chunk is all-or-nothing on its own; nothing is atomic
/// across chunks.
pub async fn write_in_chunks(
    store: &dyn VersionedStore,
    ops: &[WriteOp],
    chunk_size: usize,
) -> Vec<ChunkOutcome<()>> {
    let calls = ranges(ops.len(), chunk_size).into_iter().map(|range| async move {
        let result = store.transact_write(ops[range.clone()].to_vec()).await;
        ChunkOutcome { range, result }
    });
    join_all(calls).await
}

/// Concurrent chunked point gets; results come back aligned with `keys`.
pub async fn get_in_chunks(
    store: &dyn VersionedStore,
    keys: &[ItemKey],
    chunk_size: usize,
) -> StoreResult<Vec<Option<StoredItem>>> {
    let calls = ranges(keys.len(), chunk_size)
        .into_iter()
        .map(|range| store.transact_get(keys[range].to_vec()));

    let mut items = Vec::with_capacity(keys.len());
    for chunk in join_all(calls).await {
        items.extend(chunk?);
    }
    Ok(items)
}

/// Input positions covered by chunks that were applied.
pub fn applied_positions<T>(outcomes: &[ChunkOutcome<T>]) -> Vec<usize> {
    outcomes
        .iter()
        .filter(|outcome| outcome.is_ok())
        .flat_map(|outcome| outcome.range.clone())
        .collect()
}

pub fn first_error<T>(outcomes: &[ChunkOutcome<T>]) -> Option<&StoreError> {
    outcomes
        .iter()
        .find_map(|outcome| outcome.result.as_ref().err())
}
