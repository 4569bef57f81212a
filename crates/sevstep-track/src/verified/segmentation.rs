//! Pure core of marker-page segmentation.
//!
//! Inputs are per-event RIPs (`None` where the tracker could not resolve
//! the instruction pointer).  Outputs are index positions into that same
//! sequence, so callers can map them back to their own records.

use super::paging::on_same_page;

// ─── Marker positions ───────────────────────────────────────────────

/// Positions whose RIP lies on the same page as `marker_vaddr`.
///
/// A `None` RIP never matches: without RIP info the instruction pointer
/// is undefined, not zero.
///
/// # Properties
///
/// - Result is strictly increasing.
/// - Every returned index is `< rips.len()`.
pub fn marker_positions(rips: &[Option<u64>], marker_vaddr: u64) -> Vec<usize> {
    let result: Vec<usize> = rips
        .iter()
        .enumerate()
        .filter_map(|(i, rip)| match rip {
            Some(rip) if on_same_page(*rip, marker_vaddr) => Some(i),
            _ => None,
        })
        .collect();

    debug_assert!(
        result.windows(2).all(|w| w[0] < w[1]),
        "marker_positions must be strictly increasing"
    );
    debug_assert!(
        result.last().map_or(true, |&last| last < rips.len()),
        "marker_positions out of bounds"
    );

    result
}

// ─── Windows between markers ────────────────────────────────────────

/// For each pair of consecutive marker positions, the positions strictly
/// between them.
///
/// # Properties
///
/// - `result.len() == markers.len().saturating_sub(1)`.
/// - Window `k` is exactly `markers[k] + 1 .. markers[k + 1]`.
/// - Windows are disjoint and never contain a marker position.
pub fn windows_between(markers: &[usize]) -> Vec<Vec<usize>> {
    debug_assert!(
        markers.windows(2).all(|w| w[0] < w[1]),
        "windows_between: markers must be strictly increasing"
    );

    let result: Vec<Vec<usize>> = markers
        .windows(2)
        .map(|pair| (pair[0] + 1..pair[1]).collect())
        .collect();

    debug_assert_eq!(
        result.len(),
        markers.len().saturating_sub(1),
        "windows_between: one window per consecutive marker pair"
    );

    result
}

/// [`marker_positions`] followed by [`windows_between`].
pub fn segment_by_marker(rips: &[Option<u64>], marker_vaddr: u64) -> Vec<Vec<usize>> {
    windows_between(&marker_positions(rips, marker_vaddr))
}
