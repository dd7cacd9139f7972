//! Boolean event filters in conjunctive normal form.
//!
//! A filter is a list of clauses; a clause is a list of `(item, negated?)`
//! terms. An event matches when every clause has at least one matching
//! term. Filters are built incrementally: terms append to the current
//! clause, [`EventFilter::new_clause`] starts the next conjunct.
//!
//! Events carry only their non-empty items, so a term whose item has value
//! id 0 tests the *absence* of the term's field in the event: `(f, 0)`
//! positive matches events with no value for field `f`, and negated matches
//! events that do have one.

use crate::item::{item_field, item_val, Item};

/// One `(item, negated?)` term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterTerm {
    pub item: Item,
    pub is_negative: bool,
}

/// CNF filter over event items.
#[derive(Clone, Debug)]
pub struct EventFilter {
    clauses: Vec<Vec<FilterTerm>>,
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter::new()
    }
}

impl EventFilter {
    /// An empty filter with one open, empty clause.
    ///
    /// With no terms added the empty clause matches nothing; a filter that
    /// should match everything is simply not attached.
    pub fn new() -> Self {
        EventFilter {
            clauses: vec![Vec::new()],
        }
    }

    /// Begin the next conjunct.
    pub fn new_clause(&mut self) {
        self.clauses.push(Vec::new());
    }

    /// Append a term to the current conjunct.
    pub fn add_term(&mut self, item: Item, is_negative: bool) {
        self.clauses
            .last_mut()
            .expect("filter always holds at least one clause")
            .push(FilterTerm { item, is_negative });
    }

    pub fn num_clauses(&self) -> usize {
        self.clauses.len()
    }

    /// Terms of clause `i`, in insertion order.
    pub fn clause_terms(&self, i: usize) -> &[FilterTerm] {
        &self.clauses[i]
    }

    /// Evaluate against the items of one event.
    pub fn match_items(&self, items: &[Item]) -> bool {
        self.clauses.iter().all(|clause| {
            clause.iter().any(|term| {
                let present = if item_val(term.item) == 0 {
                    let f = item_field(term.item);
                    !items.iter().any(|&it| item_field(it) == f)
                } else {
                    items.contains(&term.item)
                };
                present != term.is_negative
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::make_item;

    #[test]
    fn empty_filter_matches_nothing() {
        let f = EventFilter::new();
        assert!(!f.match_items(&[make_item(1, 1)]));
        assert!(!f.match_items(&[]));
    }

    #[test]
    fn single_positive_term() {
        let mut f = EventFilter::new();
        let a = make_item(1, 3);
        f.add_term(a, false);
        assert!(f.match_items(&[a]));
        assert!(f.match_items(&[make_item(2, 9), a]));
        assert!(!f.match_items(&[make_item(1, 4)]));
    }

    #[test]
    fn negated_term() {
        let mut f = EventFilter::new();
        let a = make_item(1, 3);
        f.add_term(a, true);
        assert!(!f.match_items(&[a]));
        assert!(f.match_items(&[make_item(1, 4)]));
        assert!(f.match_items(&[]));
    }

    #[test]
    fn disjunction_within_clause() {
        let mut f = EventFilter::new();
        let a = make_item(1, 1);
        let b = make_item(1, 2);
        f.add_term(a, false);
        f.add_term(b, false);
        assert!(f.match_items(&[a]));
        assert!(f.match_items(&[b]));
        assert!(!f.match_items(&[make_item(1, 3)]));
    }

    #[test]
    fn conjunction_across_clauses() {
        let mut f = EventFilter::new();
        let a = make_item(1, 1);
        let b = make_item(2, 1);
        f.add_term(a, false);
        f.new_clause();
        f.add_term(b, false);
        assert!(f.match_items(&[a, b]));
        assert!(!f.match_items(&[a]));
        assert!(!f.match_items(&[b]));
        assert_eq!(f.num_clauses(), 2);
    }

    #[test]
    fn empty_value_terms_test_field_absence() {
        let price_empty = make_item(3, 0);
        let mut has_no_price = EventFilter::new();
        has_no_price.add_term(price_empty, false);
        let mut has_price = EventFilter::new();
        has_price.add_term(price_empty, true);

        let with_price = [make_item(3, 7)];
        let without_price = [make_item(1, 1)];
        assert!(!has_no_price.match_items(&with_price));
        assert!(has_no_price.match_items(&without_price));
        assert!(has_price.match_items(&with_price));
        assert!(!has_price.match_items(&without_price));
    }
}
