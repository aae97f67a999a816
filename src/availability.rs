use crate::model::Span;

// ── Free-slot calculation ─────────────────────────────────────────

/// Free intervals inside `window` once every `busy` interval is removed.
///
/// Busy intervals may arrive unsorted, overlapping, or partly outside the
/// window. They are clipped to the window, sorted, merged (touching intervals
/// merge too) and subtracted. The result is sorted, pairwise disjoint and
/// never contains zero-length spans. An empty or inverted window yields
/// nothing.
pub fn free_slots(window: Span, busy: &[Span]) -> Vec<Span> {
    if window.is_empty() {
        return Vec::new();
    }
    let blocked = busy_within(window, busy);
    subtract_intervals(&[window], &blocked)
}

/// Busy intervals clipped to `window`, sorted and merged.
pub fn busy_within(window: Span, busy: &[Span]) -> Vec<Span> {
    let mut clipped: Vec<Span> = busy.iter().filter_map(|s| s.clip(&window)).collect();
    clipped.sort_by_key(|s| s.start);
    merge_overlapping(&clipped)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted `to_remove` from sorted disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
