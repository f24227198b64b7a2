//! Numeric kernels shared by the analysis components
//!
//! Everything here returns `Option` when the statistic is undefined for the
//! input (too few points, zero variance, singular design) instead of
//! producing NaN.

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Residual sum of squares below this relative size counts as a perfect fit
const PERFECT_FIT_EPS: f64 = 1e-12;

/// Column norms below this fraction of the original norm are collinear
const COLLINEARITY_TOLERANCE: f64 = 1e-8;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1 denominator)
pub fn variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

/// Two-sided p-value for a t statistic
pub fn two_sided_p(t: f64, df: f64) -> Option<f64> {
    if !(df > 0.0) || t.is_nan() {
        return None;
    }
    if t.is_infinite() {
        return Some(0.0);
    }
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some((2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0))
}

/// Two-sided critical value, e.g. `t_critical(0.05, df)` for a 95 % interval
pub fn t_critical(alpha: f64, df: f64) -> Option<f64> {
    if !(df > 0.0) || !(alpha > 0.0 && alpha < 1.0) {
        return None;
    }
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(dist.inverse_cdf(1.0 - alpha / 2.0))
}

/// Pearson correlation with its two-sided significance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub r: f64,
    pub p_value: f64,
    pub n: usize,
}

/// Pearson r and p-value. `None` when fewer than 3 pairs or either side is
/// constant.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<Correlation> {
    let n = x.len().min(y.len());
    if n < 3 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x)?;
    let my = mean(y)?;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }

    let r = (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0);
    let df = (n - 2) as f64;
    let p_value = if 1.0 - r.abs() < 1e-15 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        two_sided_p(t, df)?
    };

    Some(Correlation { r, p_value, n })
}

/// Coefficient of determination of `predicted` against `actual`.
/// `None` when `actual` has zero variance.
pub fn r_squared(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    let m = mean(actual)?;
    let ss_tot: f64 = actual.iter().map(|a| (a - m).powi(2)).sum();
    if ss_tot <= 0.0 {
        return None;
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).powi(2))
        .sum();
    Some(1.0 - ss_res / ss_tot)
}

/// Indices of `key` sorted descending, ties broken by position
fn ranked_indices(key: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..key.len()).collect();
    idx.sort_by(|&a, &b| key[b].total_cmp(&key[a]).then(a.cmp(&b)));
    idx
}

/// Mean of `values` over the rows with the largest and smallest `key`,
/// taking `fraction` of the rows (at least one) on each side.
///
/// Returns `(top_mean, bottom_mean)`.
pub fn extreme_group_means(key: &[f64], values: &[f64], fraction: f64) -> Option<(f64, f64)> {
    let n = key.len().min(values.len());
    if n == 0 {
        return None;
    }
    let k = ((n as f64 * fraction).floor() as usize).clamp(1, n);
    let ranked = ranked_indices(&key[..n]);

    let top: Vec<f64> = ranked[..k].iter().map(|&i| values[i]).collect();
    let bottom: Vec<f64> = ranked[n - k..].iter().map(|&i| values[i]).collect();
    Some((mean(&top)?, mean(&bottom)?))
}

/// Columns of `x` (row-major, no intercept) that are linearly independent of
/// the intercept and of the columns kept before them, in order.
pub fn independent_columns(x: &[Vec<f64>]) -> Vec<usize> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let p = x[0].len();
    let inv_sqrt_n = 1.0 / (n as f64).sqrt();
    let mut basis: Vec<Vec<f64>> = vec![vec![inv_sqrt_n; n]];
    let mut kept = Vec::new();

    for j in 0..p {
        let mut v: Vec<f64> = x.iter().map(|row| row[j]).collect();
        let original_norm = v.iter().map(|a| a * a).sum::<f64>().sqrt();
        if original_norm == 0.0 {
            continue;
        }
        for q in &basis {
            let dot: f64 = v.iter().zip(q).map(|(a, b)| a * b).sum();
            for (vi, qi) in v.iter_mut().zip(q) {
                *vi -= dot * qi;
            }
        }
        let norm = v.iter().map(|a| a * a).sum::<f64>().sqrt();
        if norm > COLLINEARITY_TOLERANCE * original_norm.max(1.0) {
            for vi in v.iter_mut() {
                *vi /= norm;
            }
            basis.push(v);
            kept.push(j);
        }
    }
    kept
}

/// Gauss-Jordan inverse with partial pivoting
pub fn invert(matrix: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    let mut a: Vec<Vec<f64>> = matrix.to_vec();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let d = a[col][col];
        for j in 0..n {
            a[col][j] /= d;
            inv[col][j] /= d;
        }
        for i in 0..n {
            if i != col {
                let factor = a[i][col];
                if factor != 0.0 {
                    for j in 0..n {
                        a[i][j] -= factor * a[col][j];
                        inv[i][j] -= factor * inv[col][j];
                    }
                }
            }
        }
    }
    Some(inv)
}

/// Ordinary least squares fit with an intercept
#[derive(Debug, Clone)]
pub struct OlsFit {
    /// Intercept first, then one per column
    pub coefficients: Vec<f64>,
    pub standard_errors: Vec<f64>,
    pub t_values: Vec<f64>,
    pub p_values: Vec<f64>,
    pub residual_df: usize,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub n: usize,
}

impl OlsFit {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.coefficients[0]
            + self.coefficients[1..]
                .iter()
                .zip(row)
                .map(|(b, x)| b * x)
                .sum::<f64>()
    }
}

/// Fit `y ~ 1 + x`. The caller is expected to have screened collinear
/// columns with [`independent_columns`]; a singular design yields `None`.
pub fn ols(x: &[Vec<f64>], y: &[f64]) -> Option<OlsFit> {
    let n = x.len();
    if n == 0 || y.len() != n {
        return None;
    }
    let p = x[0].len() + 1;
    if n <= p {
        return None;
    }

    let design: Vec<Vec<f64>> = x
        .iter()
        .map(|row| std::iter::once(1.0).chain(row.iter().copied()).collect())
        .collect();

    let mut xtx = vec![vec![0.0; p]; p];
    let mut xty = vec![0.0; p];
    for (row, &target) in design.iter().zip(y) {
        for i in 0..p {
            xty[i] += row[i] * target;
            for j in 0..p {
                xtx[i][j] += row[i] * row[j];
            }
        }
    }

    let xtx_inv = invert(&xtx)?;
    let coefficients: Vec<f64> = (0..p)
        .map(|i| (0..p).map(|j| xtx_inv[i][j] * xty[j]).sum())
        .collect();

    let fitted: Vec<f64> = design
        .iter()
        .map(|row| row.iter().zip(&coefficients).map(|(a, b)| a * b).sum())
        .collect();
    let ss_res: f64 = y.iter().zip(&fitted).map(|(a, f)| (a - f).powi(2)).sum();
    let my = mean(y)?;
    let ss_tot: f64 = y.iter().map(|a| (a - my).powi(2)).sum();

    let residual_df = n - p;
    let sigma2 = ss_res / residual_df as f64;
    let perfect = ss_res <= PERFECT_FIT_EPS * ss_tot.max(1.0);

    let standard_errors: Vec<f64> = (0..p)
        .map(|i| (sigma2 * xtx_inv[i][i]).max(0.0).sqrt())
        .collect();
    let t_values: Vec<f64> = coefficients
        .iter()
        .zip(&standard_errors)
        .map(|(b, se)| {
            if perfect || *se == 0.0 {
                if *b == 0.0 {
                    0.0
                } else {
                    f64::INFINITY.copysign(*b)
                }
            } else {
                b / se
            }
        })
        .collect();
    let p_values: Vec<f64> = t_values
        .iter()
        .map(|&t| two_sided_p(t, residual_df as f64).unwrap_or(1.0))
        .collect();

    let r_squared = if ss_tot > 0.0 {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (n - 1) as f64 / residual_df as f64;

    Some(OlsFit {
        coefficients,
        standard_errors,
        t_values,
        p_values,
        residual_df,
        r_squared,
        adj_r_squared,
        n,
    })
}

/// Standardize a column to zero mean and unit sample deviation.
/// `None` when the column is constant.
pub fn standardize(values: &[f64]) -> Option<Vec<f64>> {
    let m = mean(values)?;
    let sd = std_dev(values)?;
    if sd <= 0.0 || !sd.is_finite() {
        return None;
    }
    Some(values.iter().map(|v| (v - m) / sd).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mean_and_variance() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), Some(5.0));
        assert!((variance(&values).unwrap() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(variance(&[1.0]), None);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_pearson_perfect_and_constant() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let c = pearson(&x, &y).unwrap();
        assert!((c.r - 1.0).abs() < 1e-12);
        assert_eq!(c.p_value, 0.0);

        let flat = vec![3.0; 10];
        assert!(pearson(&x, &flat).is_none());
    }

    #[test]
    fn test_pearson_known_value() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 5.0, 4.0, 5.0];
        let c = pearson(&x, &y).unwrap();
        assert!((c.r - 0.7745966692).abs() < 1e-9);
        // t = 2.12132, df = 3
        assert!((c.p_value - 0.1240).abs() < 1e-3);
    }

    #[test]
    fn test_t_critical() {
        let t = t_critical(0.05, 10.0).unwrap();
        assert!((t - 2.228).abs() < 1e-3);
    }

    #[test]
    fn test_extreme_group_means() {
        let key = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let values = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0];
        let (top, bottom) = extreme_group_means(&key, &values, 0.25).unwrap();
        assert_eq!(top, 75.0);
        assert_eq!(bottom, 15.0);
    }

    #[test]
    fn test_ols_recovers_coefficients() {
        let x: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![i as f64, ((i * 7) % 5) as f64])
            .collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, r)| 3.0 + 2.0 * r[0] - 1.5 * r[1] + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        let fit = ols(&x, &y).unwrap();
        assert!((fit.coefficients[1] - 2.0).abs() < 0.05);
        assert!((fit.coefficients[2] + 1.5).abs() < 0.1);
        assert!(fit.r_squared > 0.99);
        assert_eq!(fit.residual_df, 17);
        assert!(fit.p_values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_independent_columns_drops_duplicates() {
        let x: Vec<Vec<f64>> = (0..10)
            .map(|i| {
                let a = i as f64;
                vec![a, 2.0 * a, (i % 3) as f64, 5.0]
            })
            .collect();
        assert_eq!(independent_columns(&x), vec![0, 2]);
    }

    #[test]
    fn test_invert_singular() {
        let m = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(invert(&m).is_none());
        let m = vec![vec![4.0, 7.0], vec![2.0, 6.0]];
        let inv = invert(&m).unwrap();
        assert!((inv[0][0] - 0.6).abs() < 1e-12);
        assert!((inv[1][1] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_r_squared_undefined_for_constant_target() {
        assert_eq!(r_squared(&[5.0, 5.0, 5.0], &[4.0, 5.0, 6.0]), None);
        assert_eq!(r_squared(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), Some(1.0));
    }

    proptest! {
        #[test]
        fn prop_pearson_bounds(
            pairs in prop::collection::vec((-1000.0f64..1000.0, -1000.0f64..1000.0), 3..60)
        ) {
            let x: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let y: Vec<f64> = pairs.iter().map(|p| p.1).collect();
            if let Some(c) = pearson(&x, &y) {
                prop_assert!((-1.0..=1.0).contains(&c.r));
                prop_assert!((0.0..=1.0).contains(&c.p_value));
                prop_assert!(c.r.is_finite() && c.p_value.is_finite());
            }
        }

        #[test]
        fn prop_standardize_has_unit_scale(
            values in prop::collection::vec(-100.0f64..100.0, 2..50)
        ) {
            if let Some(z) = standardize(&values) {
                let m = mean(&z).unwrap();
                let sd = std_dev(&z).unwrap();
                prop_assert!(m.abs() < 1e-9);
                prop_assert!((sd - 1.0).abs() < 1e-9);
            }
        }
    }
}
