use std::collections::HashMap;

use gridclaim_shared::{Cell, RankingEntry, top_n};

/// Running claim totals keyed by owner, by group and by (owner, group).
///
/// A cell counts toward its owner when it has one, toward its group when it
/// has one, and toward the pair only when it has both. Zero entries are
/// removed so the maps compare equal to a fresh rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateCounters {
    by_owner: HashMap<String, u64>,
    by_group: HashMap<String, u64>,
    by_owner_group: HashMap<(String, String), u64>,
}

impl AggregateCounters {
    fn attribute(&mut self, cell: &Cell) {
        if let Some(owner) = &cell.owner_id {
            *self.by_owner.entry(owner.clone()).or_default() += 1;
        }
        if let Some(group) = &cell.group_id {
            *self.by_group.entry(group.clone()).or_default() += 1;
        }
        if let (Some(owner), Some(group)) = (&cell.owner_id, &cell.group_id) {
            *self
                .by_owner_group
                .entry((owner.clone(), group.clone()))
                .or_default() += 1;
        }
    }

    fn detach(&mut self, cell: &Cell) {
        if let Some(owner) = &cell.owner_id {
            decrement(&mut self.by_owner, owner);
        }
        if let Some(group) = &cell.group_id {
            decrement(&mut self.by_group, group);
        }
        if let (Some(owner), Some(group)) = (&cell.owner_id, &cell.group_id) {
            decrement(&mut self.by_owner_group, &(owner.clone(), group.clone()));
        }
    }

    pub fn owner(&self, owner: &str) -> u64 {
        self.by_owner.get(owner).copied().unwrap_or(0)
    }

    pub fn group(&self, group: &str) -> u64 {
        self.by_group.get(group).copied().unwrap_or(0)
    }

    pub fn owner_group(&self, owner: &str, group: &str) -> u64 {
        self.by_owner_group
            .get(&(owner.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn distinct_owners(&self) -> usize {
        self.by_owner.len()
    }

    pub fn distinct_groups(&self) -> usize {
        self.by_group.len()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, u64)> {
        self.by_group.iter().map(|(name, count)| (name.as_str(), *count))
    }
}

fn decrement<K>(map: &mut HashMap<K, u64>, key: &K)
where
    K: std::hash::Hash + Eq,
{
    if let Some(count) = map.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// Canonical coordinate → cell mapping.
#[derive(Debug, Default)]
pub struct CellStore {
    cells: HashMap<(i64, i64), Cell>,
    counters: AggregateCounters,
}

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by coordinate, moving the counter attribution from the
    /// previous occupant to the new one. Returns the replaced cell.
    pub fn upsert(&mut self, cell: Cell) -> Option<Cell> {
        self.counters.attribute(&cell);
        let previous = self.cells.insert(cell.key(), cell);
        if let Some(old) = &previous {
            self.counters.detach(old);
        }
        previous
    }

    pub fn get(&self, x: i64, y: i64) -> Option<&Cell> {
        self.cells.get(&(x, y))
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        self.cells.contains_key(&(x, y))
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&Cell)) {
        for cell in self.cells.values() {
            visitor(cell);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn counters(&self) -> &AggregateCounters {
        &self.counters
    }

    /// Rebuild the counters from the full cell set. Returns `true` when the
    /// incrementally maintained counters had drifted from the rebuild.
    pub fn reconcile_counters(&mut self) -> bool {
        let rebuilt = rebuild_counters(self.cells.values());
        let drifted = rebuilt != self.counters;
        self.counters = rebuilt;
        drifted
    }

    /// Groups ordered by claimed count, ties broken by name.
    pub fn top_groups_by_count(&self, n: usize) -> Vec<RankingEntry> {
        let entries = self
            .counters
            .groups()
            .map(|(name, count)| RankingEntry {
                name: name.to_string(),
                count,
            })
            .collect();
        top_n(entries, n)
    }
}

fn rebuild_counters<'a>(cells: impl Iterator<Item = &'a Cell>) -> AggregateCounters {
    let mut counters = AggregateCounters::default();
    for cell in cells {
        counters.attribute(cell);
    }
    counters
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use gridclaim_shared::GridGeometry;

    fn cell(x: i64, y: i64, owner: Option<&str>, group: Option<&str>) -> Cell {
        let mut c = Cell::new(&GridGeometry::default(), x, y, "#fff").expect("valid cell");
        c.owner_id = owner.map(str::to_string);
        c.group_id = group.map(str::to_string);
        c
    }

    #[test]
    fn upsert_replaces_and_returns_previous() {
        let mut store = CellStore::new();
        assert!(store.upsert(cell(0, 0, Some("a"), Some("X"))).is_none());
        let previous = store
            .upsert(cell(0, 0, Some("b"), Some("Y")))
            .expect("previous occupant");
        assert_eq!(previous.owner_id.as_deref(), Some("a"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0, 0).and_then(|c| c.owner_id.as_deref()), Some("b"));
    }

    #[test]
    fn counters_move_with_replacement() {
        let mut store = CellStore::new();
        store.upsert(cell(0, 0, Some("a"), Some("X")));
        store.upsert(cell(20, 0, Some("a"), Some("X")));
        store.upsert(cell(0, 0, Some("b"), Some("X")));

        let counters = store.counters();
        assert_eq!(counters.owner("a"), 1);
        assert_eq!(counters.owner("b"), 1);
        assert_eq!(counters.group("X"), 2);
        assert_eq!(counters.owner_group("a", "X"), 1);
        assert_eq!(counters.owner_group("b", "X"), 1);
    }

    #[test]
    fn zero_entries_are_removed() {
        let mut store = CellStore::new();
        store.upsert(cell(0, 0, Some("a"), Some("X")));
        store.upsert(cell(0, 0, None, None));
        assert_eq!(store.counters().distinct_owners(), 0);
        assert_eq!(store.counters().distinct_groups(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn incremental_counters_match_reconciliation(
            upserts in prop::collection::vec((0i64..8, 0i64..8, 0usize..4, 0usize..3), 1..400)
        ) {
            let owners = [None, Some("a"), Some("b"), Some("c")];
            let groups = [None, Some("X"), Some("Y")];
            let mut store = CellStore::new();
            // an 8x8 patch keeps overwrites frequent
            for (x, y, owner, group) in upserts {
                store.upsert(cell(x * 20, y * 20, owners[owner], groups[group]));
            }

            let incremental = store.counters().clone();
            prop_assert!(!store.reconcile_counters(), "counters drifted from rebuild");
            prop_assert_eq!(&incremental, store.counters());

            let mut owner_total = 0;
            store.for_each(|c| {
                if c.owner_id.as_deref() == Some("a") {
                    owner_total += 1;
                }
            });
            prop_assert_eq!(store.counters().owner("a"), owner_total);
        }
    }

    #[test]
    fn top_groups_orders_by_count_then_name() {
        let mut store = CellStore::new();
        store.upsert(cell(0, 0, None, Some("B")));
        store.upsert(cell(20, 0, None, Some("A")));
        store.upsert(cell(40, 0, None, Some("C")));
        store.upsert(cell(60, 0, None, Some("C")));

        let top = store.top_groups_by_count(2);
        assert_eq!(top.len(), 2);
        assert_eq!((top[0].name.as_str(), top[0].count), ("C", 2));
        assert_eq!((top[1].name.as_str(), top[1].count), ("A", 1));
    }
}
