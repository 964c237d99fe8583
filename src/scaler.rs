//! Feature standardization with stored parameters

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Standard scaler fitted with population statistics (ddof = 0).
///
/// `scale[j]` is `sqrt(var[j])`, or `0.0` for a constant feature, in which
/// case every transformed value of that feature is `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub scale: Vec<f64>,
    pub n_samples: usize,
}

impl FeatureScaler {
    /// Fit on a `(n_samples, n_features)` matrix
    pub fn fit(features: &Array2<f64>) -> crate::Result<Self> {
        let n_samples = features.nrows();
        if n_samples == 0 {
            anyhow::bail!("Cannot fit a scaler on an empty feature matrix");
        }

        let mean = features
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow::anyhow!("Feature matrix has no rows"))?;
        let var = features.var_axis(Axis(0), 0.0);

        let scale: Vec<f64> = mean
            .iter()
            .zip(var.iter())
            .map(|(&m, &v)| {
                if is_constant_feature(v, m, n_samples) {
                    0.0
                } else {
                    v.sqrt()
                }
            })
            .collect();

        Ok(Self {
            mean: mean.to_vec(),
            var: var.to_vec(),
            scale,
            n_samples,
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// Standardize every row of `features`
    pub fn transform(&self, features: &Array2<f64>) -> crate::Result<Array2<f64>> {
        if features.ncols() != self.n_features() {
            anyhow::bail!(
                "Scaler was fitted on {} features but got {}",
                self.n_features(),
                features.ncols()
            );
        }

        let mut scaled = features.clone();
        for mut row in scaled.rows_mut() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = self.scale_value(j, *value);
            }
        }
        Ok(scaled)
    }

    /// Standardize a single feature vector, e.g. an unseen customer
    pub fn transform_row(&self, row: ArrayView1<f64>) -> crate::Result<Array1<f64>> {
        if row.len() != self.n_features() {
            anyhow::bail!(
                "Feature vector must have exactly {} dimensions",
                self.n_features()
            );
        }
        Ok(row
            .iter()
            .enumerate()
            .map(|(j, &value)| self.scale_value(j, value))
            .collect())
    }

    pub fn fit_transform(features: &Array2<f64>) -> crate::Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(features)?;
        let scaled = scaler.transform(features)?;
        Ok((scaler, scaled))
    }

    fn scale_value(&self, feature: usize, value: f64) -> f64 {
        let scale = self.scale[feature];
        if scale == 0.0 {
            return 0.0;
        }
        let scaled = (value - self.mean[feature]) / scale;
        if scaled.is_finite() {
            scaled
        } else {
            0.0
        }
    }
}

/// A variance this close to zero is round-off from summing identical values
fn is_constant_feature(var: f64, mean: f64, n_samples: usize) -> bool {
    let eps = f64::EPSILON;
    let n = n_samples as f64;
    let upper_bound = n * eps * var + (n * mean * eps).powi(2);
    !var.is_finite() || var <= upper_bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn test_population_variance() {
        let features = array![[1.0, 10.0], [3.0, 10.0]];
        let scaler = FeatureScaler::fit(&features).unwrap();
        assert_eq!(scaler.mean, vec![2.0, 10.0]);
        // ddof = 0: ((1-2)^2 + (3-2)^2) / 2
        assert_eq!(scaler.var, vec![1.0, 0.0]);
    }

    #[test]
    fn test_constant_feature_scales_to_zero() {
        let features = array![[0.1, 1.0], [0.1, 2.0], [0.1, 3.0]];
        let (scaler, scaled) = FeatureScaler::fit_transform(&features).unwrap();
        assert_eq!(scaler.scale[0], 0.0);
        assert!(scaled.column(0).iter().all(|&v| v == 0.0));
        assert!(scaled.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_transform_row_matches_matrix_transform() {
        let features = array![[1.0, 5.0, 9.0], [2.0, 7.0, 1.0], [6.0, 1.0, 3.0]];
        let (scaler, scaled) = FeatureScaler::fit_transform(&features).unwrap();
        let row = scaler.transform_row(features.row(1)).unwrap();
        assert_eq!(row, scaled.row(1).to_owned());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let features = array![[1.0, 2.0], [3.0, 4.0]];
        let scaler = FeatureScaler::fit(&features).unwrap();
        assert!(scaler.transform_row(array![1.0, 2.0, 3.0].view()).is_err());
        assert!(scaler.transform(&array![[1.0], [2.0]]).is_err());
    }

    #[test]
    fn test_empty_matrix_is_rejected() {
        let features = Array2::<f64>::zeros((0, 5));
        assert!(FeatureScaler::fit(&features).is_err());
    }

    proptest! {
        #[test]
        fn prop_standardized_mean_zero_variance_one(
            rows in prop::collection::vec(prop::array::uniform5(-1000i32..1000), 2..40)
        ) {
            let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().map(|&v| v as f64)).collect();
            let features = Array2::from_shape_vec((rows.len(), 5), flat).unwrap();
            let (scaler, scaled) = FeatureScaler::fit_transform(&features).unwrap();

            for j in 0..5 {
                let column = scaled.column(j);
                let mean = column.mean().unwrap();
                let squares: f64 = column.iter().map(|v| (v - mean).powi(2)).sum();
                let var = squares / column.len() as f64;
                prop_assert!(mean.abs() < 1e-6);
                if scaler.scale[j] == 0.0 {
                    prop_assert!(column.iter().all(|&v| v == 0.0));
                } else {
                    prop_assert!((var - 1.0).abs() < 1e-6);
                }
            }
        }
    }
}
