// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Quorum arithmetic.

/// Minimum number of successes that form a majority of `count` responses.
///
/// `count / 2 + 1`; with zero responses a majority still needs one success,
/// so an empty round can never gate anything open.
pub fn majority_size(count: usize) -> usize {
    count / 2 + 1
}

/// Whether `responses` contains a majority of successes.
pub fn has_majority(responses: &[bool]) -> bool {
    responses.iter().filter(|ok| **ok).count() >= majority_size(responses.len())
}
