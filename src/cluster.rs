//! Seeded k-means used only to pick HMM starting parameters.
//!
//! K-means++ initialization followed by Lloyd iterations, over standardized
//! (step length, altitude) pairs. Cluster moments are then moment-matched to
//! per-state gamma starting parameters, with clusters ordered by step mean so
//! the state indexing is deterministic for a given seed.

use crate::stats::gamma_from_moments;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kmeans: empty data")]
    EmptyData,
    #[error("kmeans: n_clusters must be in 1..=n_points, got k={k}, n={n}")]
    BadClusterCount { k: usize, n: usize },
}

#[derive(Debug, Clone)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            max_iter: 100,
            tolerance: 1e-6,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Flat centroid data: `n_clusters * 2` values (standardized units).
    pub centroids: Vec<f64>,
    /// Cluster label for each input point.
    pub labels: Vec<usize>,
    /// Sum of squared distances to the nearest centroid.
    pub inertia: f64,
    pub n_iter: usize,
}

/// Minimal xorshift64 PRNG; no external dependency needed for seeding.
struct Xorshift64(u64);

impl Xorshift64 {
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_bounded(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

fn dist2(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// Run k-means on 2-d points (already standardized by the caller).
pub fn kmeans(points: &[[f64; 2]], config: &KMeansConfig) -> Result<KMeansResult> {
    let n = points.len();
    let k = config.n_clusters;
    if n == 0 {
        return Err(Error::EmptyData);
    }
    if k == 0 || k > n {
        return Err(Error::BadClusterCount { k, n });
    }

    let mut rng = Xorshift64(config.seed.max(1));

    // k-means++ seeding: first centroid uniform, the rest weighted by the
    // squared distance to the nearest chosen centroid
    let mut centroids: Vec<[f64; 2]> = Vec::with_capacity(k);
    centroids.push(points[rng.next_bounded(n as u64) as usize]);
    let mut d2 = vec![0.0f64; n];
    while centroids.len() < k {
        let mut total = 0.0;
        for (i, p) in points.iter().enumerate() {
            let best = centroids
                .iter()
                .map(|c| dist2(p, c))
                .fold(f64::INFINITY, f64::min);
            d2[i] = best;
            total += best;
        }
        if total == 0.0 {
            // all remaining points coincide with a centroid
            centroids.push(points[rng.next_bounded(n as u64) as usize]);
            continue;
        }
        let mut target = rng.next_f64() * total;
        let mut chosen = n - 1;
        for (i, w) in d2.iter().enumerate() {
            target -= w;
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(points[chosen]);
    }

    // Lloyd iterations
    let mut labels = vec![0usize; n];
    let mut inertia = f64::INFINITY;
    let mut n_iter = 0;
    for iter in 0..config.max_iter {
        n_iter = iter + 1;

        // assignment
        let mut new_inertia = 0.0;
        for (i, p) in points.iter().enumerate() {
            let mut best = 0;
            let mut best_d = f64::INFINITY;
            for (j, c) in centroids.iter().enumerate() {
                let d = dist2(p, c);
                if d < best_d {
                    best_d = d;
                    best = j;
                }
            }
            labels[i] = best;
            new_inertia += best_d;
        }

        // update
        let mut sums = vec![[0.0f64; 2]; k];
        let mut counts = vec![0usize; k];
        for (p, &l) in points.iter().zip(labels.iter()) {
            sums[l][0] += p[0];
            sums[l][1] += p[1];
            counts[l] += 1;
        }
        for j in 0..k {
            if counts[j] > 0 {
                centroids[j][0] = sums[j][0] / counts[j] as f64;
                centroids[j][1] = sums[j][1] / counts[j] as f64;
            } else {
                // re-seed an empty cluster from a random point
                centroids[j] = points[rng.next_bounded(n as u64) as usize];
            }
        }

        if (inertia - new_inertia).abs() < config.tolerance {
            inertia = new_inertia;
            break;
        }
        inertia = new_inertia;
    }

    Ok(KMeansResult {
        centroids: centroids.iter().flat_map(|c| [c[0], c[1]]).collect(),
        labels,
        inertia,
        n_iter,
    })
}

/// Gamma starting parameters for one emission stream of one state.
#[derive(Debug, Clone, Copy)]
pub struct StreamInit {
    pub shape: f64,
    pub rate: f64,
}

/// Per-state starting values derived from cluster moments.
#[derive(Debug, Clone)]
pub struct StateInit {
    pub step: StreamInit,
    pub alt: StreamInit,
    pub n_members: usize,
}

/// Cluster complete (step, altitude) observations and map each cluster's raw
/// moments to gamma starting parameters. Returned states are ordered by
/// ascending step mean.
pub fn initial_params(
    steps: &[f64],
    alts: &[f64],
    n_states: usize,
    seed: u64,
    max_iter: usize,
) -> Result<Vec<StateInit>> {
    assert_eq!(steps.len(), alts.len());

    // complete observations only
    let raw: Vec<[f64; 2]> = steps
        .iter()
        .zip(alts.iter())
        .filter(|(s, a)| !s.is_nan() && !a.is_nan())
        .map(|(&s, &a)| [s, a])
        .collect();
    if raw.is_empty() {
        return Err(Error::EmptyData);
    }

    // standardize each feature for the distance metric
    let n = raw.len() as f64;
    let mut mean = [0.0f64; 2];
    for p in raw.iter() {
        mean[0] += p[0];
        mean[1] += p[1];
    }
    mean[0] /= n;
    mean[1] /= n;
    let mut var = [0.0f64; 2];
    for p in raw.iter() {
        var[0] += (p[0] - mean[0]) * (p[0] - mean[0]);
        var[1] += (p[1] - mean[1]) * (p[1] - mean[1]);
    }
    var[0] = (var[0] / n).max(1e-12);
    var[1] = (var[1] / n).max(1e-12);
    let std = [var[0].sqrt(), var[1].sqrt()];
    let scaled: Vec<[f64; 2]> = raw
        .iter()
        .map(|p| [(p[0] - mean[0]) / std[0], (p[1] - mean[1]) / std[1]])
        .collect();

    let config = KMeansConfig {
        n_clusters: n_states,
        max_iter,
        seed,
        ..Default::default()
    };
    let res = kmeans(&scaled, &config)?;

    // raw per-cluster moments
    let mut inits = Vec::with_capacity(n_states);
    for j in 0..n_states {
        let members: Vec<&[f64; 2]> = raw
            .iter()
            .zip(res.labels.iter())
            .filter(|(_, &l)| l == j)
            .map(|(p, _)| p)
            .collect();
        let cnt = members.len();
        let (step_init, alt_init) = if cnt < 2 {
            (
                StreamInit {
                    shape: 1.0,
                    rate: 1.0,
                },
                StreamInit {
                    shape: 1.0,
                    rate: 1.0,
                },
            )
        } else {
            let m = cnt as f64;
            let mut mu = [0.0f64; 2];
            for p in members.iter() {
                mu[0] += p[0];
                mu[1] += p[1];
            }
            mu[0] /= m;
            mu[1] /= m;
            let mut v = [0.0f64; 2];
            for p in members.iter() {
                v[0] += (p[0] - mu[0]) * (p[0] - mu[0]);
                v[1] += (p[1] - mu[1]) * (p[1] - mu[1]);
            }
            v[0] = (v[0] / m).max(1e-9);
            v[1] = (v[1] / m).max(1e-9);
            let (s_shape, s_rate) = gamma_from_moments(mu[0], v[0]);
            let (a_shape, a_rate) = gamma_from_moments(mu[1], v[1]);
            (
                StreamInit {
                    shape: s_shape,
                    rate: s_rate,
                },
                StreamInit {
                    shape: a_shape,
                    rate: a_rate,
                },
            )
        };
        inits.push(StateInit {
            step: step_init,
            alt: alt_init,
            n_members: cnt,
        });
    }

    // deterministic state order: ascending step mean
    inits.sort_by(|a, b| {
        let ma = a.step.shape / a.step.rate;
        let mb = b.step.shape / b.step.rate;
        ma.partial_cmp(&mb).unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(inits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_separated() -> Vec<[f64; 2]> {
        let mut pts = vec![];
        for i in 0..40 {
            let jitter = (i % 7) as f64 * 0.01;
            pts.push([0.0 + jitter, 0.0 + jitter]);
            pts.push([10.0 + jitter, 0.0 - jitter]);
            pts.push([0.0 - jitter, 10.0 + jitter]);
        }
        pts
    }

    #[test]
    fn kmeans_recovers_separated_clusters() {
        let pts = well_separated();
        let res = kmeans(
            &pts,
            &KMeansConfig {
                n_clusters: 3,
                ..Default::default()
            },
        )
        .unwrap();
        // all three points of each triple land in distinct clusters
        let l0 = res.labels[0];
        let l1 = res.labels[1];
        let l2 = res.labels[2];
        assert!(l0 != l1 && l1 != l2 && l0 != l2);
        for chunk in res.labels.chunks(3) {
            assert_eq!(chunk, &[l0, l1, l2]);
        }
        assert!(res.inertia < 1.0);
    }

    #[test]
    fn kmeans_is_deterministic_for_seed() {
        let pts = well_separated();
        let cfg = KMeansConfig {
            n_clusters: 3,
            seed: 7,
            ..Default::default()
        };
        let a = kmeans(&pts, &cfg).unwrap();
        let b = kmeans(&pts, &cfg).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn kmeans_rejects_bad_inputs() {
        assert!(matches!(
            kmeans(&[], &KMeansConfig::default()),
            Err(Error::EmptyData)
        ));
        let pts = [[0.0, 0.0]];
        assert!(matches!(
            kmeans(
                &pts,
                &KMeansConfig {
                    n_clusters: 2,
                    ..Default::default()
                }
            ),
            Err(Error::BadClusterCount { .. })
        ));
    }

    #[test]
    fn initial_params_orders_by_step_mean() {
        // three regimes: short/low, medium/high, long/medium
        let mut steps = vec![];
        let mut alts = vec![];
        for i in 0..60 {
            let j = (i % 5) as f64;
            steps.push(10.0 + j);
            alts.push(5.0 + j * 0.1);
            steps.push(500.0 + j * 10.0);
            alts.push(800.0 + j);
            steps.push(2000.0 + j * 20.0);
            alts.push(100.0 + j);
        }
        // a few missing rows must be skipped, not break anything
        steps.push(f64::NAN);
        alts.push(50.0);
        let inits = initial_params(&steps, &alts, 3, 42, 100).unwrap();
        assert_eq!(inits.len(), 3);
        let means: Vec<f64> = inits.iter().map(|s| s.step.shape / s.step.rate).collect();
        assert!(means[0] < means[1] && means[1] < means[2]);
        assert!(inits.iter().all(|s| s.n_members > 0));
    }
}
