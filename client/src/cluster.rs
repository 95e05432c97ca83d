use std::collections::{HashSet, VecDeque};

use gridclaim_shared::{Cell, GridGeometry, WorldRect};

use crate::cell_store::CellStore;
use crate::error::ClusterError;

/// One maximal 4-connected run of same-group cells. Recomputed from scratch on
/// every pass; nothing about a cluster survives between passes.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub group_id: String,
    /// Covers every member cell, so `max` is the far edge of the last cell.
    pub bounds: WorldRect,
    pub count: usize,
}

impl Cluster {
    /// Label anchor: the centre of the bounding box.
    pub fn centroid(&self) -> (f64, f64) {
        (
            (self.bounds.min_x + self.bounds.max_x) / 2.0,
            (self.bounds.min_y + self.bounds.max_y) / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.bounds.width()
    }

    pub fn height(&self) -> f64 {
        self.bounds.height()
    }
}

/// Partition every grouped cell into connected components. Cells without a
/// group never join a cluster.
///
/// Output is sorted by group, then bounding box origin, then the cluster's
/// first cell in row-major order, so two passes over the same store compare
/// equal regardless of hash iteration order.
pub fn compute_clusters(
    store: &CellStore,
    geometry: &GridGeometry,
) -> Result<Vec<Cluster>, ClusterError> {
    let step = geometry.grid_step;
    let mut visited: HashSet<(i64, i64)> = HashSet::new();
    visited
        .try_reserve(store.len())
        .map_err(|_| ClusterError::Exhausted { cells: store.len() })?;
    let mut queue: VecDeque<(i64, i64)> = VecDeque::new();
    let mut clusters = Vec::new();

    for seed in store.iter() {
        let Some(group) = seed.group_id.as_deref() else {
            continue;
        };
        if !visited.insert(seed.key()) {
            continue;
        }

        queue.clear();
        queue.push_back(seed.key());
        let (mut min_x, mut min_y) = seed.key();
        let (mut max_x, mut max_y) = seed.key();
        let mut count = 0usize;
        // (y, x) of the topmost-leftmost member; unique per cluster
        let mut anchor = (seed.key().1, seed.key().0);

        while let Some((x, y)) = queue.pop_front() {
            count += 1;
            anchor = anchor.min((y, x));
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for (nx, ny) in [(x + step, y), (x - step, y), (x, y + step), (x, y - step)] {
                if visited.contains(&(nx, ny)) || !same_group(store.get(nx, ny), group) {
                    continue;
                }
                visited.insert((nx, ny));
                queue
                    .try_reserve(1)
                    .map_err(|_| ClusterError::Exhausted { cells: store.len() })?;
                queue.push_back((nx, ny));
            }
        }

        let cluster = Cluster {
            group_id: group.to_string(),
            bounds: WorldRect::new(
                min_x as f64,
                min_y as f64,
                (max_x + step) as f64,
                (max_y + step) as f64,
            ),
            count,
        };
        clusters.push((anchor, cluster));
    }

    clusters.sort_by(|(anchor_a, a), (anchor_b, b)| {
        a.group_id
            .cmp(&b.group_id)
            .then(a.bounds.min_x.total_cmp(&b.bounds.min_x))
            .then(a.bounds.min_y.total_cmp(&b.bounds.min_y))
            .then(anchor_a.cmp(anchor_b))
    });
    Ok(clusters.into_iter().map(|(_, cluster)| cluster).collect())
}

fn same_group(cell: Option<&Cell>, group: &str) -> bool {
    cell.and_then(|c| c.group_id.as_deref()) == Some(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grouped(g: &GridGeometry, x: i64, y: i64, group: &str) -> Cell {
        Cell::new(g, x, y, "#fff").expect("cell").with_group(group)
    }

    fn store_of(cells: impl IntoIterator<Item = Cell>) -> CellStore {
        let mut store = CellStore::new();
        for cell in cells {
            store.upsert(cell);
        }
        store
    }

    #[test]
    fn row_of_three_is_one_cluster() {
        let g = GridGeometry::default();
        let store = store_of([
            grouped(&g, 0, 0, "X"),
            grouped(&g, 20, 0, "X"),
            grouped(&g, 40, 0, "X"),
        ]);
        let clusters = compute_clusters(&store, &g).expect("clusters");
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 3);
        assert_eq!(clusters[0].bounds, WorldRect::new(0.0, 0.0, 60.0, 20.0));
        assert_eq!(clusters[0].centroid(), (30.0, 10.0));
    }

    #[test]
    fn gap_row_splits_cluster() {
        let g = GridGeometry::default();
        let store = store_of([
            grouped(&g, 0, 0, "X"),
            grouped(&g, 20, 0, "X"),
            grouped(&g, 40, 0, "X"),
            grouped(&g, 0, 40, "X"),
        ]);
        let clusters = compute_clusters(&store, &g).expect("clusters");
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].count, 3);
        assert_eq!(clusters[0].bounds, WorldRect::new(0.0, 0.0, 60.0, 20.0));
        assert_eq!(clusters[1].count, 1);
        assert_eq!(clusters[1].bounds, WorldRect::new(0.0, 40.0, 20.0, 60.0));
    }

    #[test]
    fn diagonal_and_foreign_groups_do_not_connect() {
        let g = GridGeometry::default();
        let store = store_of([
            grouped(&g, 0, 0, "X"),
            grouped(&g, 20, 20, "X"),
            grouped(&g, 20, 0, "Y"),
            Cell::new(&g, 40, 0, "#fff").expect("cell"),
        ]);
        let clusters = compute_clusters(&store, &g).expect("clusters");
        assert_eq!(clusters.len(), 3);
        assert!(clusters.iter().all(|c| c.count == 1));
        assert_eq!(clusters.iter().filter(|c| c.group_id == "X").count(), 2);
    }

    #[test]
    fn clusters_sharing_a_bounding_box_origin_sort_stably() {
        let g = GridGeometry::default();
        // an L around the corner cell: both clusters start at (0, 0)
        let l_shape = [(0, 40), (20, 40), (40, 40), (40, 20), (40, 0)];
        let mut cells: Vec<Cell> = l_shape
            .iter()
            .map(|&(x, y)| grouped(&g, x, y, "X"))
            .collect();
        cells.push(grouped(&g, 0, 0, "X"));

        let forward = compute_clusters(&store_of(cells.clone()), &g).expect("clusters");
        let reversed = compute_clusters(&store_of(cells.into_iter().rev()), &g).expect("clusters");
        assert_eq!(forward, reversed);
        assert_eq!(forward.iter().map(|c| c.count).collect::<Vec<_>>(), vec![1, 5]);
    }

    /// Distinct grid origins in a 10x6 patch, each with an optional group,
    /// paired with the same cells in a shuffled order.
    fn layout_and_shuffle() -> impl Strategy<Value = (Vec<((i64, i64), usize)>, Vec<((i64, i64), usize)>)> {
        prop::collection::btree_map((0i64..10, 0i64..6), 0usize..3, 0..60)
            .prop_map(|cells| cells.into_iter().collect::<Vec<_>>())
            .prop_flat_map(|cells| (Just(cells.clone()), Just(cells).prop_shuffle()))
    }

    fn build(g: &GridGeometry, layout: &[((i64, i64), usize)]) -> CellStore {
        let groups = [None, Some("A"), Some("B")];
        store_of(layout.iter().map(|&((x, y), group)| {
            let cell = Cell::new(g, x * 20, y * 20, "#fff").expect("cell");
            match groups[group] {
                Some(name) => cell.with_group(name),
                None => cell,
            }
        }))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn repeated_runs_agree_regardless_of_insertion_order(
            (layout, shuffled) in layout_and_shuffle()
        ) {
            let g = GridGeometry::default();
            let forward = build(&g, &layout);
            let reordered = build(&g, &shuffled);

            let first = compute_clusters(&forward, &g).expect("clusters");
            let second = compute_clusters(&forward, &g).expect("clusters");
            let other = compute_clusters(&reordered, &g).expect("clusters");
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&first, &other);

            let grouped_cells = layout.iter().filter(|(_, group)| *group != 0).count();
            prop_assert_eq!(first.iter().map(|c| c.count).sum::<usize>(), grouped_cells);
        }
    }

    #[test]
    fn empty_store_has_no_clusters() {
        let g = GridGeometry::default();
        let clusters = compute_clusters(&CellStore::new(), &g).expect("clusters");
        assert!(clusters.is_empty());
    }
}
