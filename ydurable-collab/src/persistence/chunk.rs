//! Greedy packing of pending updates into size-bounded merged chunks.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Update;

use super::PersistenceError;

/// Merge encoded v1 updates into one encoded v1 update.
pub fn merge_updates<B: AsRef<[u8]>>(updates: &[B]) -> Result<Vec<u8>, PersistenceError> {
    let mut decoded = Vec::with_capacity(updates.len());
    for bytes in updates {
        let update = Update::decode_v1(bytes.as_ref())
            .map_err(|e| PersistenceError::Decode(e.to_string()))?;
        decoded.push(update);
    }
    Ok(Update::merge_updates(decoded).encode_v1())
}

/// Pack `records` (in clock order) on top of an optional `seed` chunk.
///
/// Every returned chunk is at most `max_chunk_bytes` long unless it holds a
/// single input that was already larger. Records are consumed strictly in
/// order; a record that does not fit seals the current chunk and seeds the
/// next one.
///
/// Each growth step runs two passes. The first folds the longest prefix of
/// records whose summed length fits in the remaining budget with a single
/// merge. The second walks the following records one by one against the
/// actual merged length, which is often smaller than the sum.
pub fn pack_chunks(
    records: &[Vec<u8>],
    seed: Option<Vec<u8>>,
    max_chunk_bytes: usize,
) -> Result<Vec<Vec<u8>>, PersistenceError> {
    let mut rest = records;
    let mut current = match seed {
        Some(seed) => seed,
        None => match rest.split_first() {
            Some((first, tail)) => {
                rest = tail;
                first.clone()
            }
            None => return Ok(Vec::new()),
        },
    };

    let mut chunks = Vec::new();
    while !rest.is_empty() {
        // Pass 1: summed-size prefix.
        let budget = max_chunk_bytes.saturating_sub(current.len());
        let mut summed = 0usize;
        let fitting = rest
            .iter()
            .take_while(|r| {
                summed += r.len();
                summed <= budget
            })
            .count();
        if fitting > 0 {
            let mut batch: Vec<&[u8]> = Vec::with_capacity(fitting + 1);
            batch.push(&current);
            batch.extend(rest[..fitting].iter().map(Vec::as_slice));
            let merged = merge_updates(&batch)?;
            if merged.len() <= max_chunk_bytes {
                current = merged;
                rest = &rest[fitting..];
            }
        }

        // Pass 2: one record at a time by merged size.
        while let Some((next, tail)) = rest.split_first() {
            rest = tail;
            let merged = merge_updates(&[current.as_slice(), next.as_slice()])?;
            if merged.len() <= max_chunk_bytes {
                current = merged;
            } else {
                chunks.push(std::mem::replace(&mut current, next.clone()));
                break;
            }
        }
    }
    chunks.push(current);
    Ok(chunks)
}
