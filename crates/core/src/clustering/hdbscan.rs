//! HDBSCAN over one-dimensional points.
//!
//! Stage by stage this follows the reference density clusterer the frame
//! grouping was validated against: core distances, Prim's minimum spanning
//! tree over mutual-reachability distances (seeded at index 0), a
//! single-linkage hierarchy, the condensed tree, excess-of-mass selection
//! without a single all-encompassing cluster, and finally point labelling.
//! Tie-breaks in the core-distance and Prim scans depend on input order in
//! the same places the reference does, so those scan orders must not be
//! "simplified". Equal-weight MST edges are merged in endpoint order; the
//! reference leaves that order to an unstable sort.

use std::collections::BTreeMap;

/// Edge of the minimum spanning tree.
#[derive(Debug, Clone, Copy)]
struct MstEdge {
    from: usize,
    to: usize,
    distance: f64,
}

/// One merge of the single-linkage hierarchy. Node ids `>= n` refer to
/// earlier merges (`id - n`).
#[derive(Debug, Clone, Copy)]
struct LinkageNode {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

/// Row of the condensed tree. Children `< n` are points, the rest clusters.
#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

/// Label every point with its cluster index, or `None` for noise.
///
/// Cluster indices are dense (`0..k`) and increase with the condensed-tree
/// id of the selected cluster. `min_cluster_size` doubles as `min_samples`.
/// Inputs with fewer points than `min_cluster_size` (or fewer than two) are
/// all noise.
pub fn hdbscan_labels(points: &[f64], min_cluster_size: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let min_cluster_size = min_cluster_size.max(2);
    if n < min_cluster_size {
        return vec![None; n];
    }

    let core = core_distances(points, min_cluster_size);
    let mut mst = prim_mst(points, &core);
    sort_mst(&mut mst);

    let hierarchy = single_linkage(&mst, n);
    let condensed = condense_tree(&hierarchy, min_cluster_size);
    let mut stability = compute_stability(&condensed);
    let selected = select_clusters(&condensed, &mut stability);
    label_points(&condensed, &selected, n)
}

fn euclidean(a: f64, b: f64) -> f64 {
    let d = a - b;
    (d * d).sqrt()
}

/// Distance from each point to its `k`-th nearest neighbour, the point
/// itself counting as the first.
fn core_distances(points: &[f64], k: usize) -> Vec<f64> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| points[a].total_cmp(&points[b]));

    let mut core = vec![0.0; points.len()];
    for (pos, &idx) in order.iter().enumerate() {
        let x = points[idx];
        let mut lo = pos;
        let mut hi = pos + 1;
        let mut found = 1;
        let mut kth = 0.0;
        while found < k {
            let below = (lo > 0).then(|| euclidean(x, points[order[lo - 1]]));
            let above = (hi < order.len()).then(|| euclidean(x, points[order[hi]]));
            kth = match (below, above) {
                (Some(b), Some(a)) if b <= a => {
                    lo -= 1;
                    b
                }
                (_, Some(a)) => {
                    hi += 1;
                    a
                }
                (Some(b), None) => {
                    lo -= 1;
                    b
                }
                (None, None) => break,
            };
            found += 1;
        }
        core[idx] = kth;
    }
    core
}

/// Prim's algorithm over the implicit complete mutual-reachability graph.
fn prim_mst(points: &[f64], core: &[f64]) -> Vec<MstEdge> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut min_reachability = vec![f64::INFINITY; n];
    let mut current_sources = vec![1usize; n];
    let mut mst = Vec::with_capacity(n - 1);

    let mut current = 0;
    for _ in 0..n - 1 {
        in_tree[current] = true;
        let current_core = core[current];

        let mut new_reachability = f64::INFINITY;
        let mut source = 0;
        let mut new_node = 0;

        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let next_min_reach = min_reachability[j];
            let next_source = current_sources[j];
            let pair = euclidean(points[current], points[j]);
            let mutual = current_core.max(core[j]).max(pair);

            if mutual > next_min_reach {
                if next_min_reach < new_reachability {
                    new_reachability = next_min_reach;
                    source = next_source;
                    new_node = j;
                }
                continue;
            }

            if mutual < next_min_reach {
                min_reachability[j] = mutual;
                current_sources[j] = current;
                if mutual < new_reachability {
                    new_reachability = mutual;
                    source = current;
                    new_node = j;
                }
            } else if next_min_reach < new_reachability {
                new_reachability = next_min_reach;
                source = next_source;
                new_node = j;
            }
        }

        mst.push(MstEdge {
            from: source,
            to: new_node,
            distance: new_reachability,
        });
        current = new_node;
    }
    mst
}

/// Order edges by weight, then by their lower and higher endpoint.
fn sort_mst(mst: &mut [MstEdge]) {
    let key = |e: &MstEdge| (e.from.min(e.to), e.from.max(e.to));
    mst.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| key(a).cmp(&key(b))));
}

/// Union-find over hierarchy node ids; every union mints a fresh id.
struct LinkageUnionFind {
    parent: Vec<Option<usize>>,
    size: Vec<usize>,
    next_label: usize,
}

impl LinkageUnionFind {
    fn new(n: usize) -> Self {
        let mut size = vec![0; 2 * n - 1];
        size[..n].fill(1);
        Self {
            parent: vec![None; 2 * n - 1],
            size,
            next_label: n,
        }
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while let Some(p) = self.parent[root] {
            root = p;
        }
        let mut cur = node;
        while let Some(p) = self.parent[cur] {
            if p == root {
                break;
            }
            self.parent[cur] = Some(root);
            cur = p;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        self.parent[a] = Some(self.next_label);
        self.parent[b] = Some(self.next_label);
        self.size[self.next_label] = self.size[a] + self.size[b];
        self.next_label += 1;
    }
}

fn single_linkage(mst: &[MstEdge], n: usize) -> Vec<LinkageNode> {
    let mut uf = LinkageUnionFind::new(n);
    mst.iter()
        .map(|edge| {
            let left = uf.find(edge.from);
            let right = uf.find(edge.to);
            let size = uf.size[left] + uf.size[right];
            uf.union(left, right);
            LinkageNode {
                left,
                right,
                distance: edge.distance,
                size,
            }
        })
        .collect()
}

/// Breadth-first listing of `root` and everything merged beneath it.
fn bfs_from_hierarchy(hierarchy: &[LinkageNode], root: usize) -> Vec<usize> {
    let n = hierarchy.len() + 1;
    let mut result = Vec::new();
    let mut queue = vec![root];
    while !queue.is_empty() {
        result.extend_from_slice(&queue);
        queue = queue
            .iter()
            .filter(|&&node| node >= n)
            .flat_map(|&node| {
                let merge = hierarchy[node - n];
                [merge.left, merge.right]
            })
            .collect();
    }
    result
}

fn subtree_size(hierarchy: &[LinkageNode], node: usize) -> usize {
    let n = hierarchy.len() + 1;
    if node >= n {
        hierarchy[node - n].size
    } else {
        1
    }
}

fn condense_tree(hierarchy: &[LinkageNode], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let n = hierarchy.len() + 1;
    let root = 2 * hierarchy.len();
    let mut relabel = vec![0usize; root + 1];
    relabel[root] = n;
    let mut next_label = n + 1;
    let mut ignore = vec![false; root + 1];
    let mut result = Vec::new();

    let fall_out = |result: &mut Vec<CondensedEdge>,
                        ignore: &mut [bool],
                        parent: usize,
                        subtree: usize,
                        lambda: f64| {
        for sub in bfs_from_hierarchy(hierarchy, subtree) {
            if sub < n {
                result.push(CondensedEdge {
                    parent,
                    child: sub,
                    lambda,
                    size: 1,
                });
            }
            ignore[sub] = true;
        }
    };

    for node in bfs_from_hierarchy(hierarchy, root) {
        if ignore[node] || node < n {
            continue;
        }

        let merge = hierarchy[node - n];
        let (left, right) = (merge.left, merge.right);
        let lambda = if merge.distance > 0.0 {
            1.0 / merge.distance
        } else {
            f64::INFINITY
        };
        let left_count = subtree_size(hierarchy, left);
        let right_count = subtree_size(hierarchy, right);

        match (left_count >= min_cluster_size, right_count >= min_cluster_size) {
            (true, true) => {
                relabel[left] = next_label;
                next_label += 1;
                result.push(CondensedEdge {
                    parent: relabel[node],
                    child: relabel[left],
                    lambda,
                    size: left_count,
                });
                relabel[right] = next_label;
                next_label += 1;
                result.push(CondensedEdge {
                    parent: relabel[node],
                    child: relabel[right],
                    lambda,
                    size: right_count,
                });
            }
            (false, false) => {
                fall_out(&mut result, &mut ignore, relabel[node], left, lambda);
                fall_out(&mut result, &mut ignore, relabel[node], right, lambda);
            }
            (false, true) => {
                relabel[right] = relabel[node];
                fall_out(&mut result, &mut ignore, relabel[node], left, lambda);
            }
            (true, false) => {
                relabel[left] = relabel[node];
                fall_out(&mut result, &mut ignore, relabel[node], right, lambda);
            }
        }
    }
    result
}

fn compute_stability(condensed: &[CondensedEdge]) -> BTreeMap<usize, f64> {
    let smallest = condensed.iter().map(|e| e.parent).min().unwrap_or(0);
    let largest_parent = condensed.iter().map(|e| e.parent).max().unwrap_or(0);
    let largest_child = condensed
        .iter()
        .map(|e| e.child)
        .max()
        .unwrap_or(0)
        .max(smallest);

    let mut births = vec![f64::NAN; largest_child + 1];
    for edge in condensed {
        births[edge.child] = edge.lambda;
    }
    births[smallest] = 0.0;

    let mut totals = vec![0.0; largest_parent - smallest + 1];
    for edge in condensed {
        totals[edge.parent - smallest] += (edge.lambda - births[edge.parent]) * edge.size as f64;
    }

    totals
        .into_iter()
        .enumerate()
        .map(|(i, s)| (i + smallest, s))
        .collect()
}

/// Excess-of-mass selection. The root is never a candidate.
fn select_clusters(condensed: &[CondensedEdge], stability: &mut BTreeMap<usize, f64>) -> Vec<usize> {
    let mut candidates: Vec<usize> = stability.keys().rev().copied().collect();
    candidates.pop();

    let cluster_tree: Vec<CondensedEdge> =
        condensed.iter().copied().filter(|e| e.size > 1).collect();
    let mut is_cluster: BTreeMap<usize, bool> = candidates.iter().map(|&c| (c, true)).collect();

    for &node in &candidates {
        let subtree_stability = cluster_tree
            .iter()
            .filter(|e| e.parent == node)
            .fold(0.0, |acc, e| acc + stability[&e.child]);

        if subtree_stability > stability[&node] {
            is_cluster.insert(node, false);
            stability.insert(node, subtree_stability);
        } else {
            for sub in bfs_from_cluster_tree(&cluster_tree, node) {
                if sub != node {
                    is_cluster.insert(sub, false);
                }
            }
        }
    }

    is_cluster
        .into_iter()
        .filter_map(|(cluster, keep)| keep.then_some(cluster))
        .collect()
}

fn bfs_from_cluster_tree(cluster_tree: &[CondensedEdge], root: usize) -> Vec<usize> {
    let mut result = Vec::new();
    let mut queue = vec![root];
    while !queue.is_empty() {
        result.extend_from_slice(&queue);
        queue = cluster_tree
            .iter()
            .filter(|e| queue.contains(&e.parent))
            .map(|e| e.child)
            .collect();
    }
    result
}

/// Walk each point up the condensed tree to its first selected ancestor.
fn label_points(condensed: &[CondensedEdge], selected: &[usize], n: usize) -> Vec<Option<usize>> {
    let max_id = condensed
        .iter()
        .map(|e| e.parent.max(e.child))
        .max()
        .unwrap_or(0);
    let mut parent_of = vec![None; max_id + 1];
    for edge in condensed {
        parent_of[edge.child] = Some(edge.parent);
    }
    // `selected` is ascending, so the position is the dense label.
    let label_of = |cluster: usize| selected.binary_search(&cluster).ok();
    let root = n;

    (0..n)
        .map(|point| {
            let mut node = point;
            while let Some(parent) = parent_of[node] {
                if let Some(label) = label_of(parent) {
                    return Some(label);
                }
                if parent == root {
                    return None;
                }
                node = parent;
            }
            None
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_separated_groups_and_an_outlier() {
        let labels = hdbscan_labels(&[0.0, 1.0, 2.0, 100.0, 101.0, 102.0, 5000.0], 2);
        assert_eq!(
            labels,
            vec![Some(0), Some(0), Some(0), Some(1), Some(1), Some(1), None]
        );
    }

    #[test]
    fn core_distance_is_nearest_other_point() {
        let core = core_distances(&[10.0, 0.0, 3.0, 3.0], 2);
        assert_eq!(core, vec![7.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn core_distance_for_larger_k() {
        let core = core_distances(&[0.0, 1.0, 5.0, 6.0], 3);
        assert_eq!(core, vec![5.0, 4.0, 4.0, 5.0]);
    }

    #[test]
    fn mst_has_n_minus_one_edges_with_mutual_reachability_weights() {
        let points = [0.0, 1.0, 2.0, 100.0];
        let core = core_distances(&points, 2);
        let mut mst = prim_mst(&points, &core);
        sort_mst(&mut mst);
        let weights: Vec<f64> = mst.iter().map(|e| e.distance).collect();
        assert_eq!(weights, vec![1.0, 1.0, 98.0]);
    }

    #[test]
    fn single_linkage_sizes_accumulate() {
        let points = [0.0, 1.0, 2.0, 100.0];
        let core = core_distances(&points, 2);
        let mut mst = prim_mst(&points, &core);
        sort_mst(&mut mst);
        let hierarchy = single_linkage(&mst, points.len());
        let sizes: Vec<usize> = hierarchy.iter().map(|h| h.size).collect();
        assert_eq!(sizes, vec![2, 3, 4]);
        assert_eq!(hierarchy[1].left, 4);
    }

    #[test]
    fn tied_edges_sort_by_endpoints() {
        let edge = |from, to, distance| MstEdge { from, to, distance };
        let mut mst = vec![
            edge(5, 4, 1.0),
            edge(2, 3, 98.0),
            edge(1, 2, 1.0),
            edge(0, 1, 1.0),
            edge(4, 3, 1.0),
        ];
        sort_mst(&mut mst);
        let order: Vec<(usize, usize)> = mst.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(order, vec![(0, 1), (1, 2), (4, 3), (5, 4), (2, 3)]);
    }

    #[test]
    fn evenly_spaced_groups_survive_tied_merges() {
        // Every in-group edge weighs 1, so merges within a group tie.
        let labels = hdbscan_labels(&[0.0, 1.0, 2.0, 3.0, 50.0, 51.0, 52.0, 53.0], 2);
        assert!(labels.iter().all(Option::is_some));
        assert!(labels[..4].iter().all(|l| *l == labels[0]));
        assert!(labels[4..].iter().all(|l| *l == labels[4]));
        assert_ne!(labels[0], labels[4]);
    }

    #[test]
    fn lone_group_is_not_a_cluster() {
        // Everything collapses into the root, which is never selected.
        assert_eq!(hdbscan_labels(&[5.0, 5.0, 5.0], 2), vec![None, None, None]);
        assert_eq!(hdbscan_labels(&[0.0, 1.0], 2), vec![None, None]);
    }

    #[test]
    fn too_few_points_are_noise() {
        assert_eq!(hdbscan_labels(&[42.0], 2), vec![None]);
        assert!(hdbscan_labels(&[], 2).is_empty());
    }

    #[test]
    fn duplicate_pairs_form_clusters() {
        let labels = hdbscan_labels(&[0.0, 0.0, 100.0, 100.0], 2);
        assert_eq!(labels, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn three_groups_select_leaves_over_parent() {
        // The two close groups merge at 10 before joining the far one at
        // 1000; both leaves are more stable than their parent.
        let points = [0.0, 1.0, 12.0, 13.0, 1000.0, 1001.0];
        let labels = hdbscan_labels(&points, 2);
        let clusters: std::collections::BTreeSet<_> = labels.iter().flatten().collect();
        assert_eq!(clusters.len(), 3);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[2]);
    }

    #[test]
    fn condensed_tree_roots_at_n() {
        let points = [0.0, 1.0, 2.0, 100.0, 101.0, 102.0, 5000.0];
        let core = core_distances(&points, 2);
        let mut mst = prim_mst(&points, &core);
        sort_mst(&mut mst);
        let hierarchy = single_linkage(&mst, points.len());
        let condensed = condense_tree(&hierarchy, 2);

        assert_eq!(condensed.iter().map(|e| e.parent).min(), Some(7));
        let outlier = condensed.iter().find(|e| e.child == 6).unwrap();
        assert_eq!(outlier.parent, 7);
        assert_eq!(outlier.lambda, 1.0 / 4898.0);
        let clusters: Vec<_> = condensed.iter().filter(|e| e.size > 1).collect();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|e| e.lambda == 1.0 / 98.0));
    }
}
