//! Topic trie for subscription matching
//!
//! Filters are stored level by level. Literal levels live in a hash map keyed
//! by `CompactString`, `+` gets its own child, and `#` is stored as a value on
//! the node that precedes it (so `a/#` sits on node `a` and also matches `a`).

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `/#` after this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic trie keyed by topic filter
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Get the value stored for `filter`, inserting `V::default()` first if
    /// there is none
    pub fn entry(&mut self, filter: &str) -> &mut V
    where
        V: Default,
    {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.get_or_insert_with(V::default);
            }

            node = if level == "+" {
                &mut **node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                break;
            }
        }

        node.value.get_or_insert_with(V::default)
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.multi_wildcard.as_mut();
            } else if level == "+" {
                node = node.single_wildcard.as_mut()?;
            } else {
                node = node.children.get_mut(level)?;
            }

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove a filter from the trie, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Apply `f` to every stored value, dropping values for which it
    /// returns `true`
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if node.value.as_mut().is_some_and(|v| pred(v)) {
            node.value = None;
        }
        if node.multi_wildcard.as_mut().is_some_and(|v| pred(v)) {
            node.multi_wildcard = None;
        }

        if let Some(child) = node.single_wildcard.as_mut() {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Call `callback` for the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let is_system_topic = topic.starts_with('$');
        Self::matches_recursive(&self.root, &levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // `#` at the root never matches a $-topic
        if !(is_system_topic && index == 0) {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some(&level) = levels.get(index) else {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if !level.starts_with('$') {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, levels, index + 1, is_system_topic, callback);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::topic::validation::topic_matches_filter;

    fn collect(trie: &TopicTrie<u32>, topic: &str) -> Vec<u32> {
        let mut matches = Vec::new();
        trie.matches(topic, |v| matches.push(*v));
        matches.sort();
        matches
    }

    #[test]
    fn test_exact_match() {
        let mut trie = TopicTrie::new();
        *trie.entry("test/topic") = 1;

        assert_eq!(collect(&trie, "test/topic"), vec![1]);
        assert!(collect(&trie, "test/other").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = TopicTrie::new();
        *trie.entry("a/+/c") = 1;
        *trie.entry("+/+/+") = 2;

        assert_eq!(collect(&trie, "a/x/c"), vec![1, 2]);
        assert!(collect(&trie, "a/x/y/c").is_empty());
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let mut trie = TopicTrie::new();
        *trie.entry("a/#") = 1;
        *trie.entry("#") = 2;

        assert_eq!(collect(&trie, "a"), vec![1, 2]);
        assert_eq!(collect(&trie, "a/b"), vec![1, 2]);
        assert_eq!(collect(&trie, "a/b/c"), vec![1, 2]);
        assert_eq!(collect(&trie, "b"), vec![2]);
    }

    #[test]
    fn test_system_topics() {
        let mut trie = TopicTrie::new();
        *trie.entry("#") = 1;
        *trie.entry("+/test") = 2;
        *trie.entry("$SYS/#") = 3;

        assert_eq!(collect(&trie, "$SYS/test"), vec![3]);
        assert_eq!(collect(&trie, "other/test"), vec![1, 2]);
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let mut trie = TopicTrie::new();
        *trie.entry("a/+/c") = 1;
        *trie.entry("a/#") = 2;

        assert_eq!(trie.remove("a/+/c"), Some(1));
        assert_eq!(trie.remove("a/+/c"), None);
        assert_eq!(trie.remove("a/#"), Some(2));
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_by_predicate() {
        let mut trie = TopicTrie::new();
        *trie.entry("a") = 1;
        *trie.entry("a/b") = 2;
        *trie.entry("+/#") = 3;

        trie.remove_by_predicate(|v| *v % 2 == 1);
        assert_eq!(collect(&trie, "a/b"), vec![2]);
        assert!(trie.get_mut("a").is_none());
        assert!(trie.get_mut("+/#").is_none());
    }

    fn level() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["a", "b", "$c", ""]).prop_map(str::to_string)
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["a", "b", "$c", "", "+"]).prop_map(str::to_string)
    }

    proptest! {
        #[test]
        fn prop_trie_agrees_with_reference(
            topic in prop::collection::vec(level(), 1..4),
            filter in prop::collection::vec(filter_level(), 1..4),
            multi in any::<bool>(),
        ) {
            let topic = topic.join("/");
            let mut filter = filter.join("/");
            if multi {
                filter.push_str("/#");
            }

            let mut trie = TopicTrie::new();
            *trie.entry(&filter) = 1u32;

            let matched = !collect(&trie, &topic).is_empty();
            prop_assert_eq!(matched, topic_matches_filter(&topic, &filter));
        }
    }
}
