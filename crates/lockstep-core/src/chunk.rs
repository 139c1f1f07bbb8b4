//! Fixed-size grouping of an ordered sequence.

/// Split `items` into consecutive groups of `size`, preserving order.
///
/// The last group may be shorter. A `size` of zero yields one group holding
/// everything. An empty input yields no groups.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    if size == 0 || size >= items.len() {
        return vec![items];
    }

    let mut groups = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            groups.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
