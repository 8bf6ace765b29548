//! Resolution of pairwise merge proposals into disjoint groups of units.
use std::collections::HashMap;

use crate::error::MergeError;

/// Disjoint sets over unit indices, with path halving and union by size.
struct DisjointSets {
    parents: Vec<usize>,
    sizes: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        DisjointSets {
            parents: (0..n).collect(),
            sizes: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parents[x] != x {
            self.parents[x] = self.parents[self.parents[x]];
            x = self.parents[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.sizes[ra] >= self.sizes[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parents[small] = big;
        self.sizes[big] += self.sizes[small];
    }
}

/// Group the units connected by the merge pairs.
///
/// Returns the groups of at least two units, each sorted by unit order, and ordered by their first unit.
/// Returns an error if a pair refers to an unknown unit.
pub fn resolve_merge_groups(
    unit_ids: &[String],
    pairs: &[(String, String)],
) -> Result<Vec<Vec<String>>, MergeError> {
    let index: HashMap<&str, usize> = unit_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let lookup = |id: &str| {
        index
            .get(id)
            .copied()
            .ok_or_else(|| MergeError::IncompatibleData(format!("Unknown unit id {}", id)))
    };

    let mut sets = DisjointSets::new(unit_ids.len());
    for (a, b) in pairs.iter() {
        sets.union(lookup(a)?, lookup(b)?);
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..unit_ids.len() {
        groups.entry(sets.find(i)).or_default().push(i);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().filter(|group| group.len() > 1).collect();
    groups.sort_by_key(|group| group[0]);

    Ok(groups
        .into_iter()
        .map(|group| group.into_iter().map(|i| unit_ids[i].clone()).collect())
        .collect())
}
