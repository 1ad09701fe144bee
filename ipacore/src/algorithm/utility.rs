use rayon::{ThreadPool, ThreadPoolBuilder};
use statrs::distribution::{Continuous, Normal};

use crate::chemistry::constants::PPM;
use crate::error::{IpaError, Result};

/// signed mass error of an observation against a theoretical m/z, in ppm
///
/// # Examples
///
/// ```
/// use ipacore::algorithm::utility::ppm_error;
///
/// let ppm = ppm_error(500.005, 500.0);
/// assert!((ppm - 10.0).abs() < 1e-9);
/// ```
pub fn ppm_error(observed: f64, theoretical: f64) -> f64 {
    (observed - theoretical) / theoretical / PPM
}

pub fn within_ppm(observed: f64, theoretical: f64, ppm: f64) -> bool {
    ppm_error(observed, theoretical).abs() <= ppm
}

/// calculate the normal probability density function
///
/// Arguments:
///
/// * `x` - value to calculate the probability density function of
/// * `mean` - mean of the normal distribution
/// * `std_dev` - standard deviation of the normal distribution, must be positive
///
/// Returns:
///
/// * `Result<f64>` - density of `x`
///
/// # Examples
///
/// ```
/// use ipacore::algorithm::utility::normal_pdf;
///
/// let pdf = normal_pdf(0.0, 0.0, 1.0).unwrap();
/// assert!((pdf - 0.3989422804014327).abs() < 1e-15);
/// ```
pub fn normal_pdf(x: f64, mean: f64, std_dev: f64) -> Result<f64> {
    let normal = Normal::new(mean, std_dev)
        .map_err(|e| IpaError::validation(format!("normal distribution with sd {std_dev}: {e}")))?;
    Ok(normal.pdf(x))
}

/// clamp a requested worker count to `[1, available cores]`
pub fn effective_num_threads(requested: usize) -> usize {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    requested.clamp(1, available)
}

/// build the bounded worker pool used by the parallel phases
pub fn build_thread_pool(num_threads: usize) -> Result<ThreadPool> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(effective_num_threads(num_threads))
        .build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_threads_never_zero() {
        assert_eq!(effective_num_threads(0), 1);
        assert!(effective_num_threads(usize::MAX) >= 1);
    }

    #[test]
    fn test_normal_pdf_rejects_zero_sd() {
        assert!(normal_pdf(0.0, 0.0, 0.0).is_err());
    }
}
