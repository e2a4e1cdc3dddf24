//! Arena-allocated B+-tree with posting sets
//!
//! Every key maps to the set of record ids (`u64`) carrying it. Leaves are
//! linked left to right for range scans. A key equal to a separator is routed
//! to the right child; leaf splits copy the first key of the new right leaf up
//! as the separator, internal splits move the middle key up.
//!
//! Removal is lazy: keys disappear from leaves but nodes are never merged, so
//! separators stay valid routing bounds and leaves may become empty.

use super::{IndexError, IndexResult};
use std::collections::BTreeSet;
use std::ops::Bound;

/// Smallest order that still splits into two non-empty halves
pub const MIN_ORDER: usize = 3;
pub const DEFAULT_ORDER: usize = 32;

type NodeRef = usize;

#[derive(Debug, Clone)]
enum Node<K> {
    Internal {
        keys: Vec<K>,
        children: Vec<NodeRef>,
    },
    Leaf {
        keys: Vec<K>,
        postings: Vec<BTreeSet<u64>>,
        next: Option<NodeRef>,
    },
}

/// B+-tree keyed by `K` holding posting sets of ids
#[derive(Debug, Clone)]
pub struct BPlusTree<K> {
    order: usize,
    nodes: Vec<Node<K>>,
    root: NodeRef,
    distinct_keys: usize,
    entries: usize,
}

impl<K: Ord + Clone> Default for BPlusTree<K> {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl<K: Ord + Clone> BPlusTree<K> {
    /// Create an empty tree; `order` is the maximum fan-out of internal nodes
    /// and is clamped to [`MIN_ORDER`]
    pub fn new(order: usize) -> Self {
        BPlusTree {
            order: order.max(MIN_ORDER),
            nodes: vec![Node::Leaf {
                keys: Vec::new(),
                postings: Vec::new(),
                next: None,
            }],
            root: 0,
            distinct_keys: 0,
            entries: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.distinct_keys
    }

    pub fn is_empty(&self) -> bool {
        self.distinct_keys == 0
    }

    /// Number of (key, id) pairs
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut node = self.root;
        while let Node::Internal { children, .. } = &self.nodes[node] {
            node = children[0];
            height += 1;
        }
        height
    }

    /// Add `id` to the posting set of `key`; returns false if already present
    pub fn insert(&mut self, key: K, id: u64) -> bool {
        let (added, split) = self.insert_into(self.root, key, id);
        if let Some((separator, right)) = split {
            let old_root = self.root;
            self.root = self.nodes.len();
            self.nodes.push(Node::Internal {
                keys: vec![separator],
                children: vec![old_root, right],
            });
        }
        if added {
            self.entries += 1;
        }
        added
    }

    fn insert_into(&mut self, node: NodeRef, key: K, id: u64) -> (bool, Option<(K, NodeRef)>) {
        let max_keys = self.max_keys();
        let leaf_sibling = self.nodes.len();

        let (pos, child) = match &mut self.nodes[node] {
            Node::Leaf { keys, postings, next } => {
                let added = match keys.binary_search(&key) {
                    Ok(pos) => postings[pos].insert(id),
                    Err(pos) => {
                        keys.insert(pos, key);
                        postings.insert(pos, BTreeSet::from([id]));
                        self.distinct_keys += 1;
                        true
                    }
                };
                if keys.len() <= max_keys {
                    return (added, None);
                }

                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_postings = postings.split_off(mid);
                let separator = right_keys[0].clone();
                let right = Node::Leaf {
                    keys: right_keys,
                    postings: right_postings,
                    next: next.take(),
                };
                *next = Some(leaf_sibling);
                self.nodes.push(right);
                return (added, Some((separator, leaf_sibling)));
            }
            Node::Internal { keys, children } => {
                let pos = keys.partition_point(|sep| sep <= &key);
                (pos, children[pos])
            }
        };

        let (added, split) = self.insert_into(child, key, id);
        let Some((separator, new_child)) = split else {
            return (added, None);
        };

        let right_ref = self.nodes.len();
        let Node::Internal { keys, children } = &mut self.nodes[node] else {
            debug_assert!(false, "internal node changed kind during insert");
            return (added, None);
        };
        keys.insert(pos, separator);
        children.insert(pos + 1, new_child);
        if keys.len() <= max_keys {
            return (added, None);
        }

        let mid = keys.len() / 2;
        let mut right_keys = keys.split_off(mid);
        let promoted = right_keys.remove(0);
        let right_children = children.split_off(mid + 1);
        self.nodes.push(Node::Internal {
            keys: right_keys,
            children: right_children,
        });
        (added, Some((promoted, right_ref)))
    }

    fn find_leaf(&self, key: &K) -> NodeRef {
        let mut node = self.root;
        while let Node::Internal { keys, children } = &self.nodes[node] {
            node = children[keys.partition_point(|sep| sep <= key)];
        }
        node
    }

    fn leftmost_leaf(&self) -> NodeRef {
        let mut node = self.root;
        while let Node::Internal { children, .. } = &self.nodes[node] {
            node = children[0];
        }
        node
    }

    /// Posting set for an exact key
    pub fn get(&self, key: &K) -> Option<&BTreeSet<u64>> {
        match &self.nodes[self.find_leaf(key)] {
            Node::Leaf { keys, postings, .. } => keys.binary_search(key).ok().map(|pos| &postings[pos]),
            Node::Internal { .. } => None,
        }
    }

    pub fn contains(&self, key: &K, id: u64) -> bool {
        self.get(key).map(|set| set.contains(&id)).unwrap_or(false)
    }

    /// Remove `id` from `key`; the key is dropped once its posting set empties
    pub fn remove(&mut self, key: &K, id: u64) -> bool {
        let leaf = self.find_leaf(key);
        let Node::Leaf { keys, postings, .. } = &mut self.nodes[leaf] else {
            return false;
        };
        let Ok(pos) = keys.binary_search(key) else {
            return false;
        };
        if !postings[pos].remove(&id) {
            return false;
        }
        if postings[pos].is_empty() {
            keys.remove(pos);
            postings.remove(pos);
            self.distinct_keys -= 1;
        }
        self.entries -= 1;
        true
    }

    /// Keys and posting sets within the bounds, in key order
    pub fn range_entries(&self, lower: Bound<&K>, upper: Bound<&K>) -> Vec<(&K, &BTreeSet<u64>)> {
        let mut out = Vec::new();
        let mut current = match lower {
            Bound::Included(k) | Bound::Excluded(k) => Some(self.find_leaf(k)),
            Bound::Unbounded => Some(self.leftmost_leaf()),
        };

        while let Some(leaf) = current {
            let Node::Leaf { keys, postings, next } = &self.nodes[leaf] else {
                break;
            };
            for (key, posting) in keys.iter().zip(postings) {
                let above_lower = match lower {
                    Bound::Included(l) => key >= l,
                    Bound::Excluded(l) => key > l,
                    Bound::Unbounded => true,
                };
                if !above_lower {
                    continue;
                }
                let below_upper = match upper {
                    Bound::Included(u) => key <= u,
                    Bound::Excluded(u) => key < u,
                    Bound::Unbounded => true,
                };
                if !below_upper {
                    return out;
                }
                out.push((key, posting));
            }
            current = *next;
        }
        out
    }

    /// Ids within the bounds, ordered by key then id
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Vec<u64> {
        self.range_entries(lower, upper)
            .into_iter()
            .flat_map(|(_, posting)| posting.iter().copied())
            .collect()
    }

    /// All keys in order
    pub fn keys(&self) -> Vec<&K> {
        self.range_entries(Bound::Unbounded, Bound::Unbounded)
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    /// Separator keys held by internal nodes
    pub fn separators(&self) -> Vec<&K> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Internal { keys, .. } => Some(keys.iter()),
                Node::Leaf { .. } => None,
            })
            .flatten()
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.order);
    }

    /// Walk the whole tree checking ordering, separator bounds, depth and the
    /// leaf chain
    pub fn verify(&self) -> IndexResult<()> {
        let mut leaf_depth = None;
        let mut leaves = Vec::new();
        let mut counts = (0usize, 0usize);
        self.verify_node(self.root, None, None, 1, &mut leaf_depth, &mut leaves, &mut counts)?;

        let mut chain = Vec::new();
        let mut current = Some(self.leftmost_leaf());
        while let Some(leaf) = current {
            if chain.len() > self.nodes.len() {
                return Err(IndexError::Invariant("leaf chain contains a cycle".to_string()));
            }
            chain.push(leaf);
            current = match &self.nodes[leaf] {
                Node::Leaf { next, .. } => *next,
                Node::Internal { .. } => {
                    return Err(IndexError::Invariant("leaf chain reaches an internal node".to_string()))
                }
            };
        }
        if chain != leaves {
            return Err(IndexError::Invariant("leaf chain does not follow key order".to_string()));
        }
        if counts != (self.distinct_keys, self.entries) {
            return Err(IndexError::Invariant(format!(
                "counted {} keys / {} entries, tree records {} / {}",
                counts.0, counts.1, self.distinct_keys, self.entries
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &self,
        node: NodeRef,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
        leaves: &mut Vec<NodeRef>,
        counts: &mut (usize, usize),
    ) -> IndexResult<()> {
        let keys = match &self.nodes[node] {
            Node::Internal { keys, .. } | Node::Leaf { keys, .. } => keys,
        };
        if keys.len() > self.max_keys() {
            return Err(IndexError::Invariant(format!("node {} overflows with {} keys", node, keys.len())));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(IndexError::Invariant(format!("node {} keys are not strictly sorted", node)));
        }
        for key in keys {
            if lower.map(|l| key < l).unwrap_or(false) || upper.map(|u| key >= u).unwrap_or(false) {
                return Err(IndexError::Invariant(format!("node {} holds a key outside its separator bounds", node)));
            }
        }

        match &self.nodes[node] {
            Node::Leaf { keys, postings, .. } => {
                if postings.len() != keys.len() {
                    return Err(IndexError::Invariant(format!("leaf {} has mismatched postings", node)));
                }
                if postings.iter().any(|p| p.is_empty()) {
                    return Err(IndexError::Invariant(format!("leaf {} retains an empty posting set", node)));
                }
                match leaf_depth {
                    Some(d) if *d != depth => {
                        return Err(IndexError::Invariant(format!(
                            "leaf {} at depth {} but other leaves at depth {}",
                            node, depth, d
                        )))
                    }
                    Some(_) => {}
                    None => *leaf_depth = Some(depth),
                }
                leaves.push(node);
                counts.0 += keys.len();
                counts.1 += postings.iter().map(|p| p.len()).sum::<usize>();
            }
            Node::Internal { keys, children } => {
                if keys.is_empty() || children.len() != keys.len() + 1 {
                    return Err(IndexError::Invariant(format!(
                        "internal node {} has {} keys and {} children",
                        node,
                        keys.len(),
                        children.len()
                    )));
                }
                for (i, &child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                    let child_upper = if i == keys.len() { upper } else { Some(&keys[i]) };
                    self.verify_node(child, child_lower, child_upper, depth + 1, leaf_depth, leaves, counts)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut tree = BPlusTree::new(4);
        for i in 0..100i64 {
            assert!(tree.insert(i, i as u64));
        }
        assert!(!tree.insert(5, 5));
        assert!(tree.insert(5, 500));
        assert_eq!(tree.len(), 100);
        assert_eq!(tree.entry_count(), 101);
        assert!(tree.height() > 2);
        tree.verify().unwrap();

        for i in 0..100i64 {
            assert!(tree.contains(&i, i as u64), "missing key {}", i);
        }
        assert_eq!(tree.get(&5).unwrap().len(), 2);
        assert!(tree.get(&1000).is_none());
    }

    #[test]
    fn test_separator_keys_route_right() {
        let mut tree = BPlusTree::new(3);
        for i in 0..50i64 {
            tree.insert(i, i as u64);
        }
        tree.verify().unwrap();
        let separators: Vec<i64> = tree.separators().into_iter().copied().collect();
        assert!(!separators.is_empty());
        for sep in separators {
            assert!(tree.contains(&sep, sep as u64), "separator {} not found", sep);
        }
    }

    #[test]
    fn test_range_inclusive() {
        let mut tree = BPlusTree::new(5);
        for i in 1..=100i64 {
            tree.insert(i, i as u64);
        }
        let ids = tree.range(Bound::Included(&40), Bound::Included(&60));
        assert_eq!(ids.len(), 21);
        assert_eq!(ids.first(), Some(&40));
        assert_eq!(ids.last(), Some(&60));

        let ids = tree.range(Bound::Excluded(&40), Bound::Excluded(&60));
        assert_eq!(ids.len(), 19);
        assert_eq!(tree.range(Bound::Unbounded, Bound::Included(&3)), vec![1, 2, 3]);
        assert_eq!(tree.range(Bound::Included(&99), Bound::Unbounded), vec![99, 100]);
    }

    #[test]
    fn test_lazy_remove() {
        let mut tree = BPlusTree::new(3);
        for i in 0..30i64 {
            tree.insert(i, i as u64);
        }
        for i in (0..30i64).step_by(2) {
            assert!(tree.remove(&i, i as u64));
        }
        assert!(!tree.remove(&0, 0));
        assert_eq!(tree.len(), 15);
        tree.verify().unwrap();
        assert!(tree.get(&4).is_none());
        assert!(tree.contains(&5, 5));
        let all = tree.range(Bound::Unbounded, Bound::Unbounded);
        assert_eq!(all, (1..30).step_by(2).collect::<Vec<u64>>());

        // Removing everything leaves empty leaves that still route correctly
        for i in (1..30i64).step_by(2) {
            tree.remove(&i, i as u64);
        }
        assert!(tree.is_empty());
        tree.verify().unwrap();
        tree.insert(7, 70);
        assert!(tree.contains(&7, 70));
        tree.verify().unwrap();
    }

    #[test]
    fn test_order_is_clamped() {
        let tree: BPlusTree<i64> = BPlusTree::new(1);
        assert_eq!(tree.order(), MIN_ORDER);
    }

    #[test]
    fn test_descending_insert() {
        let mut tree = BPlusTree::new(4);
        for i in (0..200i64).rev() {
            tree.insert(i, 1);
        }
        tree.verify().unwrap();
        let keys: Vec<i64> = tree.keys().into_iter().copied().collect();
        assert_eq!(keys, (0..200).collect::<Vec<i64>>());
    }
}
