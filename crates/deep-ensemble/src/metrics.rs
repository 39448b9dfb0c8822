use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};
use statrs::statistics::Statistics;

/// Root-mean-squared error between two aligned vectors. Empty input scores 0.
pub fn rmse(truth: &DVector<f64>, predicted: &DVector<f64>) -> Result<f64, String> {
    if truth.len() != predicted.len() {
        return Err(format!(
            "{} true values but {} predictions",
            truth.len(),
            predicted.len()
        ));
    }
    if truth.is_empty() {
        return Ok(0.0);
    }
    let sum_sq: f64 = truth
        .iter()
        .zip(predicted.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    Ok((sum_sq / truth.len() as f64).sqrt())
}

/// Negative mean log-density of `truth` under `Normal(mean, std_dev)`, per sample.
pub fn mean_gaussian_nll(
    truth: &DVector<f64>,
    mean: &DVector<f64>,
    std_dev: &DVector<f64>,
) -> Result<f64, String> {
    if truth.is_empty() {
        return Err("cannot score an empty validation set".to_string());
    }
    if mean.len() != truth.len() || std_dev.len() != truth.len() {
        return Err(format!(
            "{} true values but {} means and {} standard deviations",
            truth.len(),
            mean.len(),
            std_dev.len()
        ));
    }
    let mut total = 0.0;
    for r in 0..truth.len() {
        let normal = Normal::new(mean[r], std_dev[r])
            .map_err(|e| format!("sample {} (mean {}, std {}): {}", r, mean[r], std_dev[r], e))?;
        total -= normal.ln_pdf(truth[r]);
    }
    let nll = total / truth.len() as f64;
    if nll.is_finite() {
        Ok(nll)
    } else {
        Err(format!("non-finite NLL {nll}"))
    }
}

/// Mean and population standard deviation of a metric across folds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: f64,
    pub std: f64,
}

impl MeanStd {
    pub fn of(values: &[f64]) -> Self {
        Self {
            mean: values.iter().mean(),
            std: values.iter().population_std_dev(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rmse() {
        let truth = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let pred = DVector::from_vec(vec![1.0, 2.0, 3.0, 10.0]);
        assert_relative_eq!(rmse(&truth, &pred).unwrap(), 3.0);
        assert_eq!(rmse(&truth, &truth).unwrap(), 0.0);
    }

    #[test]
    fn test_misaligned_inputs_are_rejected() {
        let truth = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let short = DVector::from_vec(vec![1.0, 2.0]);
        let err = rmse(&truth, &short).unwrap_err();
        assert!(err.contains("3 true values but 2 predictions"));

        let sigma = DVector::from_element(3, 1.0);
        assert!(mean_gaussian_nll(&truth, &short, &sigma).is_err());
        assert!(mean_gaussian_nll(&truth, &truth, &short).is_err());
    }

    #[test]
    fn test_nll_at_mean_of_standard_normal() {
        let y = DVector::from_element(4, 5.0);
        let sigma = DVector::from_element(4, 1.0);
        let nll = mean_gaussian_nll(&y, &y, &sigma).unwrap();
        assert_relative_eq!(nll, 0.5 * (2.0 * std::f64::consts::PI).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_nll_rejects_degenerate_scale() {
        let y = DVector::from_element(2, 0.0);
        let sigma = DVector::from_vec(vec![1.0, 0.0]);
        let err = mean_gaussian_nll(&y, &y, &sigma).unwrap_err();
        assert!(err.contains("sample 1"));
    }

    #[test]
    fn test_mean_std_uses_population_deviation() {
        let stats = MeanStd::of(&[1.0, 3.0]);
        assert_relative_eq!(stats.mean, 2.0);
        assert_relative_eq!(stats.std, 1.0);

        let single = MeanStd::of(&[0.7]);
        assert_relative_eq!(single.std, 0.0);
    }
}
