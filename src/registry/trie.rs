//! Longest-prefix-match store over path segments, keyed by host.
//!
//! Keys are canonical route keys (`host[/seg[/seg...]]`); the host is the
//! first segment. A node may carry a pool; lookups return the pool of the
//! deepest matching node along the exact segment path. Pools are held as
//! `Arc`s so an in-flight request keeps its pool alive after the trie
//! drops the node.

use std::collections::HashMap;
use std::sync::Arc;

use crate::route::EndpointPool;

#[derive(Default)]
pub struct Trie {
    children: HashMap<String, Trie>,
    pool: Option<Arc<EndpointPool>>,
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
}

impl Trie {
    pub fn new() -> Trie {
        Trie::default()
    }

    /// Inserts a pool at the key, creating intermediate nodes as needed.
    /// An existing pool at the key is replaced.
    pub fn insert(&mut self, key: &str, pool: Arc<EndpointPool>) {
        let mut node = self;
        for segment in segments(key) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.pool = Some(pool);
    }

    /// Exact-key lookup.
    pub fn find(&self, key: &str) -> Option<Arc<EndpointPool>> {
        let mut node = self;
        for segment in segments(key) {
            node = node.children.get(segment)?;
        }
        node.pool.clone()
    }

    /// Longest-prefix lookup: the pool of the deepest node with a pool
    /// along the key's segment path.
    pub fn match_uri(&self, key: &str) -> Option<Arc<EndpointPool>> {
        let mut node = self;
        let mut deepest: Option<Arc<EndpointPool>> = None;
        for segment in segments(key) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    if node.pool.is_some() {
                        deepest = node.pool.clone();
                    }
                }
                None => break,
            }
        }
        deepest
    }

    /// Removes the pool at the key and snips now-empty nodes on the way
    /// back up, so no poolless leaf remains.
    pub fn delete(&mut self, key: &str) -> bool {
        let parts: Vec<&str> = segments(key).collect();
        Self::delete_segments(self, &parts).0
    }

    /// Returns (removed_a_pool, child_should_be_dropped).
    fn delete_segments(node: &mut Trie, parts: &[&str]) -> (bool, bool) {
        match parts.split_first() {
            None => {
                let removed = node.pool.take().is_some();
                (removed, node.children.is_empty())
            }
            Some((head, rest)) => {
                let Some(child) = node.children.get_mut(*head) else {
                    return (false, false);
                };
                let (removed, drop_child) = Self::delete_segments(child, rest);
                if drop_child {
                    node.children.remove(*head);
                }
                (
                    removed,
                    node.pool.is_none() && node.children.is_empty(),
                )
            }
        }
    }

    /// Visits every node carrying a pool, passing the node's full key.
    pub fn each_node_with_pool(&self, mut visitor: impl FnMut(&str, &Arc<EndpointPool>)) {
        fn walk(
            node: &Trie,
            path: &mut String,
            visitor: &mut impl FnMut(&str, &Arc<EndpointPool>),
        ) {
            if let Some(pool) = &node.pool {
                visitor(path, pool);
            }
            for (segment, child) in &node.children {
                let len = path.len();
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
                walk(child, path, visitor);
                path.truncate(len);
            }
        }
        let mut path = String::new();
        walk(self, &mut path, &mut visitor);
    }

    pub fn pool_count(&self) -> usize {
        let mut count = 0;
        self.each_node_with_pool(|_, _| count += 1);
        count
    }

    pub fn endpoint_count(&self) -> usize {
        let mut count = 0;
        self.each_node_with_pool(|_, pool| count += pool.len());
        count
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_none() && self.children.is_empty()
    }

    /// Route key -> member addresses, for the routes snapshot.
    pub fn to_map(&self) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        self.each_node_with_pool(|key, pool| {
            map.insert(key.to_string(), pool.addresses());
        });
        map
    }
}
