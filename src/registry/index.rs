//! Inverted index from normalized tag to the agents advertising it

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct CapabilityIndex {
    tags: HashMap<String, HashSet<String>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent_id: &str, tags: &[String]) {
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(agent_id.to_string());
        }
    }

    pub fn remove(&mut self, agent_id: &str, tags: &[String]) {
        for tag in tags {
            if let Some(agents) = self.tags.get_mut(tag) {
                agents.remove(agent_id);
                if agents.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    /// Swap an agent's tag set: stale tags dropped, new ones added
    pub fn replace(&mut self, agent_id: &str, old: &[String], new: &[String]) {
        let keep: HashSet<&String> = new.iter().collect();
        let stale: Vec<String> = old.iter().filter(|t| !keep.contains(t)).cloned().collect();
        self.remove(agent_id, &stale);
        self.insert(agent_id, new);
    }

    /// Agents advertising at least one of `tags`
    pub fn candidates(&self, tags: &[String]) -> HashSet<String> {
        tags.iter()
            .filter_map(|t| self.tags.get(t))
            .flat_map(|agents| agents.iter().cloned())
            .collect()
    }

    pub fn agents_for(&self, tag: &str) -> Option<&HashSet<String>> {
        self.tags.get(tag)
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Every agent id referenced anywhere in the index
    pub fn referenced_agents(&self) -> HashSet<&str> {
        self.tags
            .values()
            .flat_map(|agents| agents.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_insert_and_candidates() {
        let mut index = CapabilityIndex::new();
        index.insert("a", &tags(&["python", "rust"]));
        index.insert("b", &tags(&["rust"]));

        let found = index.candidates(&tags(&["rust"]));
        assert_eq!(found.len(), 2);
        let found = index.candidates(&tags(&["python", "go"]));
        assert_eq!(found, HashSet::from(["a".to_string()]));
        assert!(index.candidates(&tags(&["go"])).is_empty());
    }

    #[test]
    fn test_replace_drops_stale_tags() {
        let mut index = CapabilityIndex::new();
        index.insert("a", &tags(&["python", "rust"]));
        index.replace("a", &tags(&["python", "rust"]), &tags(&["rust", "go"]));

        assert!(index.agents_for("python").is_none());
        assert!(index.agents_for("go").is_some_and(|s| s.contains("a")));
        assert_eq!(index.tag_count(), 2);
    }

    #[test]
    fn test_remove_cleans_empty_tags() {
        let mut index = CapabilityIndex::new();
        index.insert("a", &tags(&["python"]));
        index.insert("b", &tags(&["python"]));
        index.remove("a", &tags(&["python"]));
        assert_eq!(index.agents_for("python").map(|s| s.len()), Some(1));
        index.remove("b", &tags(&["python"]));
        assert_eq!(index.tag_count(), 0);
        assert!(index.referenced_agents().is_empty());
    }
}
