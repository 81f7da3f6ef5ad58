//! Snapshot diffing for query replies.
//!
//! A service may answer a query request with a full snapshot instead of
//! an event list. These routines reduce the snapshot to the minimal
//! client-facing events that transform the cached view into it.

use std::collections::HashMap;

use common::Value;

/// Diff two models.
///
/// Returns the change delta (removed keys as delete markers) and the
/// old values of every changed pre-existing key. Both are empty when
/// the models are equal.
pub fn model_diff(
    old: &HashMap<String, Value>,
    new: &HashMap<String, Value>,
) -> (HashMap<String, Value>, HashMap<String, Value>) {
    let mut changed = HashMap::new();
    let mut old_values = HashMap::new();

    for (key, value) in new {
        match old.get(key) {
            Some(prev) if prev == value => {}
            Some(prev) => {
                old_values.insert(key.clone(), prev.clone());
                changed.insert(key.clone(), value.clone());
            }
            None => {
                changed.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, prev) in old {
        if !new.contains_key(key) {
            old_values.insert(key.clone(), prev.clone());
            changed.insert(key.clone(), Value::Delete);
        }
    }

    (changed, old_values)
}

/// A single step transforming one collection into another.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOp {
    Remove { idx: usize },
    Add { idx: usize, value: Value },
}

/// Diff two collections into a remove/add sequence.
///
/// Uses a longest-common-subsequence reduction. Removes come first in
/// descending old-index order (so earlier indices stay valid), then
/// adds in ascending new-index order. Applying the ops in order
/// transforms `old` into `new`.
pub fn collection_diff(old: &[Value], new: &[Value]) -> Vec<CollectionOp> {
    let m = old.len();
    let n = new.len();

    // lcs[i][j] = LCS length of old[..i] and new[..j]
    let mut lcs = vec![vec![0usize; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            lcs[i][j] = if old[i - 1] == new[j - 1] {
                lcs[i - 1][j - 1] + 1
            } else {
                lcs[i - 1][j].max(lcs[i][j - 1])
            };
        }
    }

    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let mut i = m;
    let mut j = n;
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1] == new[j - 1] {
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || lcs[i][j - 1] >= lcs[i - 1][j]) {
            adds.push(CollectionOp::Add {
                idx: j - 1,
                value: new[j - 1].clone(),
            });
            j -= 1;
        } else {
            removes.push(CollectionOp::Remove { idx: i - 1 });
            i -= 1;
        }
    }

    // The backward walk yields removes in descending index order and
    // adds in descending order; adds must apply ascending.
    adds.reverse();
    removes.extend(adds);
    removes
}
