use std::collections::{BTreeMap, HashMap};

use crate::chemistry::elements::isotopes;
use crate::error::{IpaError, Result};

/// convolve two distributions of masses and abundances
///
/// Arguments:
///
/// * `dist_a` - first distribution of masses and abundances
/// * `dist_b` - second distribution of masses and abundances
/// * `mass_tolerance` - mass tolerance for combining peaks
/// * `abundance_threshold` - minimum abundance for a peak to be included in the result
/// * `max_results` - maximum number of peaks to include in the result
///
/// Returns:
///
/// * `Vec<(f64, f64)>` - combined distribution of masses and abundances, sorted by mass
///
/// # Examples
///
/// ```
/// use ipacore::algorithm::isotope::convolve;
///
/// let dist_a = vec![(100.0, 0.5), (101.0, 0.5)];
/// let dist_b = vec![(100.0, 0.5), (101.0, 0.5)];
/// let result = convolve(&dist_a, &dist_b, 1e-6, 1e-12, 200);
/// assert_eq!(result, vec![(200.0, 0.25), (201.0, 0.5), (202.0, 0.25)]);
/// ```
pub fn convolve(
    dist_a: &[(f64, f64)],
    dist_b: &[(f64, f64)],
    mass_tolerance: f64,
    abundance_threshold: f64,
    max_results: usize,
) -> Vec<(f64, f64)> {
    let mut result: Vec<(f64, f64)> = Vec::new();

    for &(mass_a, abundance_a) in dist_a {
        for &(mass_b, abundance_b) in dist_b {
            let combined_mass = mass_a + mass_b;
            let combined_abundance = abundance_a * abundance_b;

            if combined_abundance < abundance_threshold {
                continue;
            }

            if let Some(entry) = result.iter_mut().find(|(m, _)| (*m - combined_mass).abs() < mass_tolerance) {
                entry.1 += combined_abundance;
            } else {
                result.push((combined_mass, combined_abundance));
            }
        }
    }

    // keep the most abundant peaks, then restore mass order
    result.sort_by(|a, b| b.1.total_cmp(&a.1));
    result.truncate(max_results);
    result.sort_by(|a, b| a.0.total_cmp(&b.0));

    result
}

/// convolve a distribution with itself n times (square-and-multiply)
///
/// # Examples
///
/// ```
/// use ipacore::algorithm::isotope::convolve_pow;
///
/// let dist = vec![(100.0, 0.5), (101.0, 0.5)];
/// let result = convolve_pow(&dist, 3, 1e-6, 1e-12, 200);
/// assert_eq!(result.len(), 4);
/// assert!((result[1].1 - 0.375).abs() < 1e-12);
/// ```
pub fn convolve_pow(
    dist: &[(f64, f64)],
    n: u32,
    mass_tolerance: f64,
    abundance_threshold: f64,
    max_results: usize,
) -> Vec<(f64, f64)> {
    let mut result = vec![(0.0, 1.0)];
    let mut base = dist.to_vec();
    let mut exponent = n;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = convolve(&result, &base, mass_tolerance, abundance_threshold, max_results);
        }
        exponent >>= 1;
        if exponent > 0 {
            base = convolve(&base, &base, mass_tolerance, abundance_threshold, max_results);
        }
    }

    result
}

/// generate the isotope distribution for a given atomic composition
///
/// Arguments:
///
/// * `atomic_composition` - element counts, all non-negative
/// * `mass_tolerance` - mass tolerance for combining peaks
/// * `abundance_threshold` - minimum abundance for a peak to be included in the result
/// * `max_result` - maximum number of peaks to include in the result
///
/// Returns:
///
/// * `Result<Vec<(f64, f64)>>` - normalized distribution of masses and abundances
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use ipacore::algorithm::isotope::generate_isotope_distribution;
///
/// let mut atomic_composition = BTreeMap::new();
/// atomic_composition.insert("C".to_string(), 5);
/// atomic_composition.insert("H".to_string(), 9);
/// atomic_composition.insert("N".to_string(), 1);
/// atomic_composition.insert("O".to_string(), 1);
/// let result = generate_isotope_distribution(&atomic_composition, 1e-3, 1e-9, 200).unwrap();
/// let total: f64 = result.iter().map(|(_, a)| a).sum();
/// assert!((total - 1.0).abs() < 1e-9);
/// ```
pub fn generate_isotope_distribution(
    atomic_composition: &BTreeMap<String, i32>,
    mass_tolerance: f64,
    abundance_threshold: f64,
    max_result: usize,
) -> Result<Vec<(f64, f64)>> {
    let mut cumulative_distribution: Option<Vec<(f64, f64)>> = None;

    for (element, &count) in atomic_composition.iter() {
        if count == 0 {
            continue;
        }
        let element_distribution = isotopes(element).ok_or_else(|| IpaError::Formula {
            formula: element.clone(),
            reason: "element not found in isotope table".into(),
        })?;
        let count = u32::try_from(count).map_err(|_| IpaError::Formula {
            formula: format!("{element}{count}"),
            reason: "negative element count".into(),
        })?;

        let element_power_distribution =
            convolve_pow(element_distribution, count, mass_tolerance, abundance_threshold, max_result);

        cumulative_distribution = match cumulative_distribution {
            Some(cum_dist) => Some(convolve(
                &cum_dist,
                &element_power_distribution,
                mass_tolerance,
                abundance_threshold,
                max_result,
            )),
            None => Some(element_power_distribution),
        };
    }

    let final_distribution = cumulative_distribution.ok_or_else(|| IpaError::Formula {
        formula: String::new(),
        reason: "composition has no elements".into(),
    })?;

    let total_abundance: f64 = final_distribution.iter().map(|&(_, abundance)| abundance).sum();
    Ok(final_distribution
        .into_iter()
        .map(|(mass, abundance)| (mass, abundance / total_abundance))
        .collect())
}

/// collapse a fine isotope distribution onto nominal mass shifts and express
/// each `M+k` peak relative to `M+0`
///
/// Arguments:
///
/// * `distribution` - (mass, abundance) pairs, e.g. from `generate_isotope_distribution`
/// * `monoisotopic_mass` - mass of the `M+0` peak
/// * `max_shift` - highest `k` to report
///
/// Returns:
///
/// * `Vec<f64>` - ratios for `k = 1..=max_shift`; zero where no peak exists
pub fn nominal_isotope_ratios(distribution: &[(f64, f64)], monoisotopic_mass: f64, max_shift: usize) -> Vec<f64> {
    let mut by_shift: HashMap<i64, f64> = HashMap::new();
    for &(mass, abundance) in distribution {
        let shift = (mass - monoisotopic_mass).round() as i64;
        *by_shift.entry(shift).or_insert(0.0) += abundance;
    }

    let mono = by_shift.get(&0).copied().unwrap_or(0.0);
    (1..=max_shift as i64)
        .map(|k| {
            if mono > 0.0 {
                by_shift.get(&k).copied().unwrap_or(0.0) / mono
            } else {
                0.0
            }
        })
        .collect()
}
