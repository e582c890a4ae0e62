use crate::model::ImportRound;

/// Collapses batch numbers into `2-4, 7, 9-11` form. Input order and
/// duplicates do not matter.
pub fn compress_ranges(numbers: &[u32]) -> String {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for number in iter {
        if number == end + 1 {
            end = number;
            continue;
        }
        parts.push(render_range(start, end));
        start = number;
        end = number;
    }
    parts.push(render_range(start, end));
    parts.join(", ")
}

fn render_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Splits missing batch numbers into import rounds of at most
/// `max_batches_per_round` batches each.
pub fn plan_rounds(missing: &[u32], max_batches_per_round: usize) -> Vec<ImportRound> {
    let mut sorted = missing.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    sorted
        .chunks(max_batches_per_round.max(1))
        .enumerate()
        .filter_map(|(index, chunk)| {
            let (first, last) = (chunk.first()?, chunk.last()?);
            Some(ImportRound {
                round: index + 1,
                batches: chunk.to_vec(),
                start_batch: *first,
                end_batch: *last,
            })
        })
        .collect()
}
