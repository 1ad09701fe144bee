//! MS2 spectral similarity.
//!
//! Peaks are aligned greedily by closest m/z within a tolerance, then the
//! cosine of the aligned intensity vectors is taken. Unmatched peaks count
//! towards the norms, so extra fragments lower the score.

use serde::{Deserialize, Serialize};

use crate::chemistry::constants::PPM;

/// Fragment matching tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum MzTolerance {
    Da(f64),
    Ppm(f64),
}

impl MzTolerance {
    /// absolute window in Da around `mz`
    pub fn window(&self, mz: f64) -> f64 {
        match *self {
            MzTolerance::Da(da) => da,
            MzTolerance::Ppm(ppm) => mz * ppm * PPM,
        }
    }
}

/// Result of a spectral similarity comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct CosineMatch {
    /// Cosine similarity score in [0, 1].
    pub score: f64,
    pub matched_peaks: usize,
}

/// Compute cosine similarity between two centroided spectra.
///
/// Arguments:
///
/// * `query_mz`, `query_intensity` - query spectrum
/// * `ref_mz`, `ref_intensity` - reference spectrum
/// * `tolerance` - maximum m/z difference for a peak pair, evaluated at the query peak
///
/// Returns:
///
/// * `CosineMatch` - score and number of matched pairs
///
/// # Examples
///
/// ```
/// use ipacore::algorithm::similarity::{cosine_similarity, MzTolerance};
///
/// let result = cosine_similarity(&[100.0, 150.0], &[1.0, 2.0], &[100.001, 150.0], &[1.0, 2.0], MzTolerance::Da(0.01));
/// assert!((result.score - 1.0).abs() < 1e-12);
/// assert_eq!(result.matched_peaks, 2);
/// ```
pub fn cosine_similarity(
    query_mz: &[f64],
    query_intensity: &[f64],
    ref_mz: &[f64],
    ref_intensity: &[f64],
    tolerance: MzTolerance,
) -> CosineMatch {
    if query_mz.is_empty() || ref_mz.is_empty() {
        return CosineMatch { score: 0.0, matched_peaks: 0 };
    }

    let mut ref_used = vec![false; ref_mz.len()];
    let mut dot = 0.0;
    let mut matched_peaks = 0;

    for (qi, &qmz) in query_mz.iter().enumerate() {
        let mut best_ri = None;
        let mut best_diff = tolerance.window(qmz);

        for (ri, &rmz) in ref_mz.iter().enumerate() {
            if ref_used[ri] {
                continue;
            }
            let diff = (qmz - rmz).abs();
            if diff <= best_diff {
                best_diff = diff;
                best_ri = Some(ri);
            }
        }

        if let Some(ri) = best_ri {
            ref_used[ri] = true;
            dot += query_intensity[qi] * ref_intensity[ri];
            matched_peaks += 1;
        }
    }

    let norm_q: f64 = query_intensity.iter().map(|i| i * i).sum::<f64>().sqrt();
    let norm_r: f64 = ref_intensity.iter().map(|i| i * i).sum::<f64>().sqrt();
    let denom = norm_q * norm_r;
    let score = if denom > 0.0 { (dot / denom).clamp(0.0, 1.0) } else { 0.0 };

    CosineMatch { score, matched_peaks }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_peaks_lower_the_score() {
        let full = cosine_similarity(&[100.0, 200.0], &[10.0, 10.0], &[100.0, 200.0], &[10.0, 10.0], MzTolerance::Ppm(10.0));
        let partial = cosine_similarity(&[100.0, 200.0], &[10.0, 10.0], &[100.0, 300.0], &[10.0, 10.0], MzTolerance::Ppm(10.0));
        assert!((full.score - 1.0).abs() < 1e-12);
        assert!((partial.score - 0.5).abs() < 1e-12);
        assert_eq!(partial.matched_peaks, 1);
    }

    #[test]
    fn test_ppm_window_scales_with_mass() {
        assert!((MzTolerance::Ppm(10.0).window(500.0) - 0.005).abs() < 1e-12);
        assert_eq!(MzTolerance::Da(0.02).window(500.0), 0.02);
        let miss = cosine_similarity(&[500.0], &[1.0], &[500.01], &[1.0], MzTolerance::Ppm(10.0));
        assert_eq!(miss.matched_peaks, 0);
        assert_eq!(miss.score, 0.0);
    }

    #[test]
    fn test_empty_spectrum_scores_zero() {
        let result = cosine_similarity(&[], &[], &[100.0], &[1.0], MzTolerance::Da(0.01));
        assert_eq!(result.score, 0.0);
    }
}
