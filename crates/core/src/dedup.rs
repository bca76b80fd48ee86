use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Cataloged,
    Repeated,
}

// Only the dispatch loop mutates this, before any download task starts.
#[derive(Debug, Default)]
pub struct DedupIndex {
    cataloged: HashSet<String>,
    scheduled: HashSet<String>,
}

impl DedupIndex {
    pub fn from_snapshot(links: impl IntoIterator<Item = String>) -> Self {
        Self {
            cataloged: links.into_iter().collect(),
            scheduled: HashSet::new(),
        }
    }

    pub fn contains(&self, link: &str) -> bool {
        self.cataloged.contains(link) || self.scheduled.contains(link)
    }

    pub fn add(&mut self, link: impl Into<String>) {
        let link = link.into();
        if !self.cataloged.contains(&link) {
            self.scheduled.insert(link);
        }
    }

    pub fn admit(&mut self, link: &str) -> Admission {
        if self.cataloged.contains(link) {
            Admission::Cataloged
        } else if !self.scheduled.insert(link.to_string()) {
            Admission::Repeated
        } else {
            Admission::New
        }
    }

    pub fn snapshot_len(&self) -> usize {
        self.cataloged.len()
    }

    pub fn len(&self) -> usize {
        self.cataloged.len() + self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Admission, DedupIndex};

    #[test]
    fn snapshot_links_are_reported_as_cataloged() {
        let mut index = DedupIndex::from_snapshot(vec!["a.pdf".to_string()]);
        assert!(index.contains("a.pdf"));
        assert_eq!(index.admit("a.pdf"), Admission::Cataloged);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn second_admission_in_a_run_is_repeated() {
        let mut index = DedupIndex::default();
        assert_eq!(index.admit("b.pdf"), Admission::New);
        assert_eq!(index.admit("b.pdf"), Admission::Repeated);
        assert!(index.contains("b.pdf"));
        assert_eq!(index.snapshot_len(), 0);
    }

    #[test]
    fn add_makes_link_known() {
        let mut index = DedupIndex::default();
        assert!(!index.contains("c.pdf"));
        index.add("c.pdf");
        assert!(index.contains("c.pdf"));
        assert_eq!(index.admit("c.pdf"), Admission::Repeated);
    }
}
