//! K-Means segmentation engine

use linfa_nn::distance::{Distance, L2Dist};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::features::FEATURE_NAMES;
use crate::scaler::FeatureScaler;

/// Default number of customer segments
pub const DEFAULT_CLUSTERS: usize = 6;
/// Default RNG seed, kept stable so runs are reproducible
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_MAX_ITERS: usize = 300;
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// Number of independent k-means++ initializations for `n_samples` points.
///
/// Small datasets get more restarts since each one is cheap; very large ones
/// get a single run.
pub fn restarts_for(n_samples: usize) -> usize {
    match n_samples {
        0..=9_999 => 10,
        10_000..=99_999 => 3,
        _ => 1,
    }
}

/// K-Means hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansParams {
    pub n_clusters: usize,
    pub seed: u64,
    /// `None` selects [`restarts_for`]
    pub restarts: Option<usize>,
    pub max_iters: usize,
    pub tolerance: f64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            n_clusters: DEFAULT_CLUSTERS,
            seed: DEFAULT_SEED,
            restarts: None,
            max_iters: DEFAULT_MAX_ITERS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Fitted K-Means partition
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansModel {
    /// Number of clusters
    pub n_clusters: usize,
    /// Cluster assignments for training data, each in `0..n_clusters`
    pub labels: Array1<usize>,
    /// Cluster centroids in standardized space, one row per cluster
    pub centroids: Array2<f64>,
    /// Within-cluster sum of squares (inertia)
    pub inertia: f64,
    /// Lloyd iterations used by the kept run
    pub n_iter: usize,
}

impl KMeansModel {
    /// Get cluster sizes
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &label in self.labels.iter() {
            if label < self.n_clusters {
                sizes[label] += 1;
            }
        }
        sizes
    }

    /// Mean silhouette coefficient over a seeded random sample of points
    pub fn compute_silhouette_sample(
        &self,
        features: &Array2<f64>,
        sample_size: usize,
        seed: u64,
    ) -> f64 {
        let n_total = features.nrows();
        let n_samples = n_total.min(sample_size);
        if n_samples < 2 {
            return 0.0;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample = index::sample(&mut rng, n_total, n_samples).into_vec();
        sample.sort_unstable();

        let mut silhouette_sum = 0.0;

        for &i in &sample {
            let point = features.row(i);
            let cluster_label = self.labels[i];

            let mut same_cluster_distances = Vec::new();
            let mut other_cluster_distances: Vec<Vec<f64>> = vec![Vec::new(); self.n_clusters];

            for &j in &sample {
                if i == j {
                    continue;
                }

                let distance = L2Dist.distance(point, features.row(j));
                let other_label = self.labels[j];

                if other_label == cluster_label {
                    same_cluster_distances.push(distance);
                } else if other_label < self.n_clusters {
                    other_cluster_distances[other_label].push(distance);
                }
            }

            let a_i = if same_cluster_distances.is_empty() {
                0.0
            } else {
                same_cluster_distances.iter().sum::<f64>() / same_cluster_distances.len() as f64
            };

            let b_i = other_cluster_distances
                .iter()
                .filter(|distances| !distances.is_empty())
                .map(|distances| distances.iter().sum::<f64>() / distances.len() as f64)
                .fold(f64::INFINITY, f64::min);

            // Singletons score 0, as do points with no other populated cluster
            let silhouette_i = if same_cluster_distances.is_empty()
                || b_i.is_infinite()
                || (a_i == 0.0 && b_i == 0.0)
            {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            };

            silhouette_sum += silhouette_i;
        }

        silhouette_sum / n_samples as f64
    }
}

/// Fit K-Means on standardized features
///
/// # Arguments
/// * `features` - Standardized feature matrix `(n_samples, n_features)`
/// * `params` - Cluster count, seed, restarts and convergence settings
///
/// # Returns
/// * The run with the lowest inertia across all restarts
pub fn fit_kmeans(features: &Array2<f64>, params: &KMeansParams) -> crate::Result<KMeansModel> {
    if params.n_clusters == 0 {
        anyhow::bail!("Number of clusters must be at least 1");
    }
    if features.nrows() == 0 {
        anyhow::bail!("Cannot cluster an empty feature matrix");
    }
    if features.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("Feature matrix contains non-finite values");
    }

    let restarts = params.restarts.unwrap_or_else(|| restarts_for(features.nrows())).max(1);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<KMeansModel> = None;

    for run in 0..restarts {
        let initial = kmeans_plus_plus(features.view(), params.n_clusters, &mut rng);
        let candidate = lloyd(features.view(), initial, params.max_iters, params.tolerance);
        debug!(run, inertia = candidate.inertia, n_iter = candidate.n_iter, "k-means run finished");

        let improves = best
            .as_ref()
            .map_or(true, |current| candidate.inertia < current.inertia);
        if improves {
            best = Some(candidate);
        }
    }

    let model = best.ok_or_else(|| anyhow::anyhow!("K-Means produced no run"))?;
    info!(
        clusters = model.n_clusters,
        restarts,
        inertia = model.inertia,
        n_iter = model.n_iter,
        "k-means fitted"
    );
    Ok(model)
}

/// k-means++ seeding: first centroid uniform, the rest weighted by squared
/// distance to the nearest chosen centroid. When every point already sits on
/// a centroid (fewer distinct points than clusters) the pick is uniform.
fn kmeans_plus_plus(features: ArrayView2<f64>, n_clusters: usize, rng: &mut StdRng) -> Array2<f64> {
    let n_samples = features.nrows();
    let mut centroids = Array2::zeros((n_clusters, features.ncols()));

    let first = rng.gen_range(0..n_samples);
    centroids.row_mut(0).assign(&features.row(first));

    let mut closest: Vec<f64> = features
        .outer_iter()
        .map(|point| L2Dist.rdistance(point, centroids.row(0)))
        .collect();

    for k in 1..n_clusters {
        let total: f64 = closest.iter().sum();
        let chosen = if total > 0.0 {
            let target = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            // Rounding can leave the target past the last positive weight
            let mut chosen = closest.iter().rposition(|&w| w > 0.0).unwrap_or(n_samples - 1);
            for (i, &weight) in closest.iter().enumerate() {
                cumulative += weight;
                if weight > 0.0 && cumulative > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.gen_range(0..n_samples)
        };

        centroids.row_mut(k).assign(&features.row(chosen));
        for (i, point) in features.outer_iter().enumerate() {
            let distance = L2Dist.rdistance(point, centroids.row(k));
            if distance < closest[i] {
                closest[i] = distance;
            }
        }
    }

    centroids
}

/// Lloyd iterations from the given centroids
fn lloyd(
    features: ArrayView2<f64>,
    mut centroids: Array2<f64>,
    max_iters: usize,
    tolerance: f64,
) -> KMeansModel {
    let n_clusters = centroids.nrows();
    let mut labels = assign(features, centroids.view());
    let mut n_iter = 0;

    while n_iter < max_iters {
        n_iter += 1;
        let previous = centroids.clone();
        update_centroids(features, &labels, &mut centroids);

        let new_labels = assign(features, centroids.view());
        let changed = new_labels != labels;
        labels = new_labels;

        let shift: f64 = previous
            .outer_iter()
            .zip(centroids.outer_iter())
            .map(|(old, new)| L2Dist.rdistance(old, new))
            .sum();

        if !changed || shift <= tolerance {
            break;
        }
    }

    let inertia = compute_inertia(features, &labels, centroids.view());

    KMeansModel {
        n_clusters,
        labels,
        centroids,
        inertia,
        n_iter,
    }
}

/// Nearest centroid and its squared distance; ties go to the lower index
pub(crate) fn nearest_centroid(point: ArrayView1<f64>, centroids: ArrayView2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (cluster, centroid) in centroids.outer_iter().enumerate() {
        let distance = L2Dist.rdistance(point, centroid);
        if distance < best.1 {
            best = (cluster, distance);
        }
    }
    best
}

fn assign(features: ArrayView2<f64>, centroids: ArrayView2<f64>) -> Array1<usize> {
    features
        .outer_iter()
        .map(|point| nearest_centroid(point, centroids).0)
        .collect()
}

/// Recompute centroids as member means; empty clusters keep their centroid
fn update_centroids(
    features: ArrayView2<f64>,
    labels: &Array1<usize>,
    centroids: &mut Array2<f64>,
) {
    let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
    let mut counts = vec![0usize; centroids.nrows()];

    for (point, &label) in features.outer_iter().zip(labels.iter()) {
        let mut sum = sums.row_mut(label);
        sum += &point;
        counts[label] += 1;
    }

    for (cluster, count) in counts.into_iter().enumerate() {
        if count > 0 {
            let mean = &sums.row(cluster) / count as f64;
            centroids.row_mut(cluster).assign(&mean);
        }
    }
}

/// Compute within-cluster sum of squares (inertia)
fn compute_inertia(
    features: ArrayView2<f64>,
    labels: &Array1<usize>,
    centroids: ArrayView2<f64>,
) -> f64 {
    features
        .outer_iter()
        .zip(labels.iter())
        .map(|(point, &cluster)| L2Dist.rdistance(point, centroids.row(cluster)))
        .sum()
}

/// Serialized model parameters: everything needed to score an unseen customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentModel {
    pub feature_names: Vec<String>,
    pub scaler: FeatureScaler,
    /// One row per cluster, in standardized space
    pub centroids: Vec<Vec<f64>>,
    pub n_clusters: usize,
    pub seed: u64,
    pub inertia: f64,
}

impl SegmentModel {
    pub fn new(scaler: &FeatureScaler, model: &KMeansModel, seed: u64) -> Self {
        Self {
            feature_names: FEATURE_NAMES.iter().map(|name| name.to_string()).collect(),
            scaler: scaler.clone(),
            centroids: model.centroids.outer_iter().map(|row| row.to_vec()).collect(),
            n_clusters: model.n_clusters,
            seed,
            inertia: model.inertia,
        }
    }

    fn centroid_matrix(&self) -> crate::Result<Array2<f64>> {
        let n_features = self.scaler.n_features();
        let flat: Vec<f64> = self.centroids.iter().flatten().copied().collect();
        Ok(Array2::from_shape_vec((self.centroids.len(), n_features), flat)?)
    }

    /// Assign a segment to raw (unscaled) feature values
    pub fn predict_raw(&self, raw_features: &[f64]) -> crate::Result<usize> {
        let scaled = self.scaler.transform_row(ArrayView1::from(raw_features))?;
        let centroids = self.centroid_matrix()?;
        Ok(nearest_centroid(scaled.view(), centroids.view()).0)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        let model: Self = serde_json::from_str(text)?;
        if model.centroids.iter().any(|row| row.len() != model.scaler.n_features()) {
            anyhow::bail!("Centroid width does not match the scaler feature count");
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn create_test_features() -> Array2<f64> {
        Array2::from_shape_vec(
            (8, 2),
            vec![
                -2.0, -2.0, //
                -2.1, -1.9, //
                -1.9, -2.1, //
                2.0, 2.0, //
                2.1, 1.9, //
                1.9, 2.1, //
                0.0, 3.0, //
                0.1, 3.1,
            ],
        )
        .unwrap()
    }

    fn params(n_clusters: usize) -> KMeansParams {
        KMeansParams {
            n_clusters,
            ..KMeansParams::default()
        }
    }

    #[test]
    fn test_fit_kmeans() {
        let features = create_test_features();
        let model = fit_kmeans(&features, &params(3)).unwrap();

        assert_eq!(model.n_clusters, 3);
        assert_eq!(model.labels.len(), 8);
        assert_eq!(model.centroids.shape(), &[3, 2]);
        assert!(model.labels.iter().all(|&l| l < 3));

        // The three well separated groups end up in three distinct clusters
        assert_eq!(model.labels[0], model.labels[1]);
        assert_eq!(model.labels[3], model.labels[4]);
        assert_eq!(model.labels[6], model.labels[7]);
        assert_ne!(model.labels[0], model.labels[3]);
        assert_ne!(model.labels[3], model.labels[6]);
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let features = create_test_features();
        let first = fit_kmeans(&features, &params(3)).unwrap();
        let second = fit_kmeans(&features, &params(3)).unwrap();
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.centroids, second.centroids);
        assert_eq!(first.inertia.to_bits(), second.inertia.to_bits());
    }

    #[test]
    fn test_ties_go_to_lower_centroid() {
        let centroids = array![[-1.0, 0.0], [1.0, 0.0], [-1.0, 0.0]];
        let (cluster, distance) = nearest_centroid(array![0.0, 0.0].view(), centroids.view());
        assert_eq!(cluster, 0);
        assert_eq!(distance, 1.0);

        let (cluster, _) = nearest_centroid(array![-1.0, 0.0].view(), centroids.view());
        assert_eq!(cluster, 0);
    }

    #[test]
    fn test_more_clusters_than_points_leaves_empty_clusters() {
        let features = array![[0.0, 0.0], [1.0, 1.0], [5.0, 5.0]];
        let model = fit_kmeans(&features, &params(6)).unwrap();

        assert_eq!(model.centroids.shape(), &[6, 2]);
        assert!(model.centroids.iter().all(|v| v.is_finite()));
        assert!(model.labels.iter().all(|&l| l < 6));
        assert_eq!(model.cluster_sizes().iter().sum::<usize>(), 3);
        assert!(model.cluster_sizes().iter().filter(|&&s| s == 0).count() >= 3);
        assert_eq!(model.inertia, 0.0);
    }

    #[test]
    fn test_segment_model_scores_raw_features() {
        let features = create_test_features();
        let scaler = FeatureScaler::fit(&features).unwrap();
        let scaled = scaler.transform(&features).unwrap();
        let model = fit_kmeans(&scaled, &params(3)).unwrap();
        let saved = SegmentModel::new(&scaler, &model, DEFAULT_SEED);

        let cluster = saved.predict_raw(&[2.05, 2.0]).unwrap();
        assert_eq!(cluster, model.labels[3]);
        assert!(saved.predict_raw(&[1.0]).is_err());
    }

    #[test]
    fn test_cluster_sizes() {
        let features = create_test_features();
        let model = fit_kmeans(&features, &params(3)).unwrap();

        let sizes = model.cluster_sizes();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().sum::<usize>(), 8);
    }

    #[test]
    fn test_invalid_inputs() {
        let features = create_test_features();
        assert!(fit_kmeans(&features, &params(0)).is_err());
        assert!(fit_kmeans(&Array2::zeros((0, 2)), &params(3)).is_err());
        assert!(fit_kmeans(&array![[f64::NAN, 0.0]], &params(1)).is_err());
    }

    #[test]
    fn test_silhouette_for_separated_clusters() {
        let features = create_test_features();
        let model = fit_kmeans(&features, &params(3)).unwrap();
        let score = model.compute_silhouette_sample(&features, 100, DEFAULT_SEED);
        assert!(score > 0.5 && score <= 1.0, "silhouette {}", score);
    }

    #[test]
    fn test_segment_model_round_trips_through_json() {
        let features = create_test_features();
        let (scaler, scaled) = FeatureScaler::fit_transform(&features).unwrap();
        let model = fit_kmeans(&scaled, &params(3)).unwrap();
        let saved = SegmentModel::new(&scaler, &model, DEFAULT_SEED);

        let restored = SegmentModel::from_json(&saved.to_json().unwrap()).unwrap();
        assert_eq!(restored.n_clusters, 3);
        assert_eq!(
            restored.predict_raw(&[-2.0, -2.0]).unwrap(),
            model.labels[0]
        );
    }

    #[test]
    fn test_restarts_shrink_with_dataset_size() {
        assert_eq!(restarts_for(500), 10);
        assert_eq!(restarts_for(50_000), 3);
        assert_eq!(restarts_for(1_000_000), 1);
    }
}
