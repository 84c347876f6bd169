pub mod explanation;
pub mod jacobian;
pub mod process_utils;
pub mod roi;
pub mod scoring;
pub mod zscore;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Insertion-ordered region name -> value mapping with unique keys.
///
/// Serializes as a JSON object whose key order is the insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for RegionMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> RegionMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; a replaced key keeps its original position.
    pub fn insert(&mut self, region: impl Into<String>, value: T) {
        let region = region.into();
        match self.entries.iter_mut().find(|(name, _)| *name == region) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((region, value)),
        }
    }

    pub fn get(&self, region: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(name, _)| name == region)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, region: &str) -> bool {
        self.get(region).is_some()
    }

    /// Position of `region` in insertion order.
    pub fn position(&self, region: &str) -> Option<usize> {
        self.entries.iter().position(|(name, _)| name == region)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

impl<T> FromIterator<(String, T)> for RegionMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = RegionMap::new();
        for (region, value) in iter {
            map.insert(region, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for RegionMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
