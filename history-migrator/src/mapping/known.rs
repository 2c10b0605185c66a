use std::collections::HashSet;

/// Snapshot of the metric names the destination already knows about, taken once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownMetricSet {
    names: HashSet<String>,
}

impl KnownMetricSet {
    pub fn new(names: HashSet<String>) -> Self {
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for KnownMetricSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}
