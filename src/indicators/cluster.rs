// =============================================================================
// 1-D density clustering
// =============================================================================
//
// DBSCAN restricted to the real line. A point is a core point when at least
// `min_pts` points (itself included) lie within `eps` of it, distance
// inclusive. Clusters grow by chaining core neighbourhoods; a non-core point
// inside some core's neighbourhood joins the first cluster that reaches it;
// anything else is noise and is dropped.
//
// Points are sorted first, so every neighbourhood is a contiguous index range
// found by binary search.

/// Group `points` into density clusters. Noise is omitted.
///
/// Clusters come back in ascending price order, each cluster's points sorted.
pub fn cluster_1d(points: &[f64], eps: f64, min_pts: usize) -> Vec<Vec<f64>> {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let neighbourhood = |i: usize| -> (usize, usize) {
        let v = sorted[i];
        let lo = sorted.partition_point(|&p| v - p > eps);
        let hi = sorted.partition_point(|&p| p - v <= eps);
        (lo, hi)
    };

    let is_core: Vec<bool> = (0..n)
        .map(|i| {
            let (lo, hi) = neighbourhood(i);
            hi - lo >= min_pts
        })
        .collect();

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut clusters = 0usize;

    for seed in 0..n {
        if !is_core[seed] || labels[seed].is_some() {
            continue;
        }

        let id = clusters;
        clusters += 1;
        labels[seed] = Some(id);
        let mut stack = vec![seed];

        while let Some(i) = stack.pop() {
            let (lo, hi) = neighbourhood(i);
            for j in lo..hi {
                if labels[j].is_none() {
                    labels[j] = Some(id);
                    if is_core[j] {
                        stack.push(j);
                    }
                }
            }
        }
    }

    let mut out = vec![Vec::new(); clusters];
    for (point, label) in sorted.into_iter().zip(labels) {
        if let Some(id) = label {
            out[id].push(point);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_clusters_and_noise() {
        let points = [5.05, 1.0, 9.0, 1.2, 5.0, 1.1];
        let clusters = cluster_1d(&points, 0.15, 2);
        assert_eq!(clusters, vec![vec![1.0, 1.1, 1.2], vec![5.0, 5.05]]);
    }

    #[test]
    fn identical_points_meet_min_pts_with_zero_eps() {
        let clusters = cluster_1d(&[100.0; 3], 0.0, 3);
        assert_eq!(clusters, vec![vec![100.0; 3]]);

        assert!(cluster_1d(&[100.0; 3], 0.0, 4).is_empty());
    }

    #[test]
    fn border_points_join_without_expanding() {
        // 1.0 is core (0.0, 1.0, 1.5 within eps); the ends are border points.
        let clusters = cluster_1d(&[0.0, 1.0, 1.5], 1.0, 3);
        assert_eq!(clusters, vec![vec![0.0, 1.0, 1.5]]);
    }

    #[test]
    fn chains_through_core_points() {
        let points: Vec<f64> = (0..6).map(|i| i as f64).collect();
        let clusters = cluster_1d(&points, 1.0, 2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 6);
    }

    #[test]
    fn isolated_points_are_noise() {
        assert!(cluster_1d(&[1.0, 10.0, 20.0], 1.0, 2).is_empty());
        assert!(cluster_1d(&[], 1.0, 1).is_empty());
    }

    #[test]
    fn min_pts_one_makes_every_point_a_cluster() {
        let clusters = cluster_1d(&[1.0, 10.0], 0.5, 1);
        assert_eq!(clusters, vec![vec![1.0], vec![10.0]]);
    }
}
