use std::{collections::HashMap, hash::Hash};

/// Disjoint-set forest over arbitrary hashable items.
///
/// Clusters are reported in the insertion order of their first member and
/// list their members in insertion order, so results are deterministic.
#[derive(Debug, Clone)]
pub struct UnionFind<T> {
    index: HashMap<T, usize>,
    items: Vec<T>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl<T> Default for UnionFind<T> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            items: Vec::new(),
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> UnionFind<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert `item` as a singleton if it is not present yet.
    pub fn insert(&mut self, item: T) -> usize {
        if let Some(&i) = self.index.get(&item) {
            return i;
        }
        let i = self.items.len();
        self.index.insert(item.clone(), i);
        self.items.push(item);
        self.parent.push(i);
        self.rank.push(0);
        i
    }

    fn root(&mut self, mut i: usize) -> usize {
        let mut top = i;
        while self.parent[top] != top {
            top = self.parent[top];
        }
        while self.parent[i] != top {
            let next = self.parent[i];
            self.parent[i] = top;
            i = next;
        }
        top
    }

    /// Representative slot of `item`, if present.
    pub fn find(&mut self, item: &T) -> Option<&T> {
        let i = *self.index.get(item)?;
        let root = self.root(i);
        Some(&self.items[root])
    }

    pub fn union(&mut self, a: T, b: T) {
        let ia = self.insert(a);
        let ib = self.insert(b);
        let (ra, rb) = (self.root(ia), self.root(ib));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    pub fn is_connected(&mut self, a: &T, b: &T) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(ia), Some(ib)) => self.root(ia) == self.root(ib),
            _ => false,
        }
    }

    /// All equivalence classes.
    pub fn clusters(&mut self) -> Vec<Vec<T>> {
        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut clusters: Vec<Vec<T>> = Vec::new();
        for i in 0..self.items.len() {
            let root = self.root(i);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                clusters.push(Vec::new());
                clusters.len() - 1
            });
            clusters[slot].push(self.items[i].clone());
        }
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clusters_are_ordered() {
        let mut uf = UnionFind::new();
        uf.insert("a");
        uf.union("b", "c");
        uf.union("c", "a");
        uf.insert("d");
        assert_eq!(uf.clusters(), vec![vec!["a", "b", "c"], vec!["d"]]);
        assert!(uf.is_connected(&"a", &"b"));
        assert!(!uf.is_connected(&"a", &"d"));
    }
}
