use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

// ── Overlap detection ─────────────────────────────────────────────

/// Ids of every booking whose span overlaps at least one other booking in `bookings`.
///
/// Pairwise scan over all unordered pairs, O(n²). Input order does not matter
/// and touching endpoints do not count. A malformed span (`end <= start`) is
/// evaluated with the same predicate rather than rejected; the engine refuses
/// such spans before they are stored, so only foreign input can carry them.
pub fn detect_overlaps<T: Scheduled>(bookings: &[T]) -> HashSet<Ulid> {
    let mut overlapping = HashSet::new();
    for (i, a) in bookings.iter().enumerate() {
        let span_a = a.span();
        for b in &bookings[i + 1..] {
            if span_a.overlaps(&b.span()) {
                overlapping.insert(a.id());
                overlapping.insert(b.id());
            }
        }
    }
    overlapping
}

/// First booking in `candidates` (other than `exclude`) whose span overlaps `span`.
pub fn find_conflict<'a, T, I>(candidates: I, span: &Span, exclude: Option<Ulid>) -> Option<Ulid>
where
    T: Scheduled + 'a,
    I: IntoIterator<Item = &'a T>,
{
    candidates
        .into_iter()
        .filter(|c| Some(c.id()) != exclude)
        .find(|c| c.span().overlaps(span))
        .map(|c| c.id())
}
