use common::domain::{PageCriteria, SearchResults};

/// Streaming page accumulator.
///
/// Results are fed in final order, possibly across several calls; only the
/// records falling inside the requested page are kept while every record is
/// counted towards the total.
#[derive(Debug)]
pub struct Pager<T> {
    offset: u64,
    limit: Option<u64>,
    seen: u64,
    results: Vec<T>,
}

impl<T> Pager<T> {
    pub fn new(criteria: &PageCriteria) -> Self {
        Self {
            offset: criteria.offset(),
            limit: criteria.limit(),
            seen: 0,
            results: Vec::new(),
        }
    }

    pub fn process(&mut self, item: T) {
        let index = self.seen;
        self.seen += 1;

        if index < self.offset {
            return;
        }
        if let Some(limit) = self.limit {
            if index >= limit {
                return;
            }
        }
        self.results.push(item);
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.process(item);
        }
    }

    pub fn into_results(self) -> SearchResults<T> {
        SearchResults {
            results: self.results,
            total: self.seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pager_keeps_requested_page_and_counts_everything() {
        let mut pager = Pager::new(&PageCriteria::new(2, 3));
        pager.extend(0..4);
        pager.extend(4..10);

        let page = pager.into_results();
        assert_eq!(page.results, vec![3, 4, 5]);
        assert_eq!(page.total, 10);
    }

    #[test]
    fn test_pager_short_last_page() {
        let mut pager = Pager::new(&PageCriteria::new(4, 3));
        pager.extend(0..10);

        let page = pager.into_results();
        assert_eq!(page.results, vec![9]);
        assert_eq!(page.total, 10);
    }

    #[test]
    fn test_pager_page_past_end_is_empty_with_total() {
        let mut pager = Pager::new(&PageCriteria::new(5, 10));
        pager.extend(0..7);

        let page = pager.into_results();
        assert!(page.results.is_empty());
        assert_eq!(page.total, 7);
    }

    #[test]
    fn test_pager_zero_page_size_returns_everything() {
        let mut pager = Pager::new(&PageCriteria::all());
        pager.extend(0..25);

        let page = pager.into_results();
        assert_eq!(page.results.len(), 25);
        assert_eq!(page.total, 25);
    }
}
