//! MS1 and MSMS annotation scoring.
//!
//! Every feature group receives a posterior over the hypotheses whose m/z
//! lies within `ppm_threshold` of its root feature, plus an `unknown`
//! alternative. The weight of a hypothesis is the product of a mass
//! likelihood, a retention-time factor, an isotope-ratio likelihood and,
//! when fragment spectra are available, the best cosine score against the
//! compound's library spectra.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithm::similarity::MzTolerance;
use crate::algorithm::utility::{build_thread_pool, normal_pdf, ppm_error, within_ppm};
use crate::chemistry::constants::PPM;
use crate::data::annotation::{AnnotationRow, AnnotationTable, Hypothesis};
use crate::data::feature::{FeatureGroup, FeatureId};
use crate::data::spectrum::{Ms2Spectrum, ReferenceSpectrum};
use crate::error::{IpaError, Result};
use crate::progress::{Phase, ProgressSink};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    /// mass accuracy of the instrument
    pub ppm: f64,
    /// largest mass error of a considered hypothesis, `2 · ppm` when unset
    pub ppm_threshold: Option<f64>,
    /// mass error attributed to the unknown hypothesis, `ppm` when unset
    pub ppm_unknown: Option<f64>,
    pub ratio_sd: f64,
    pub ratio_unknown: f64,
    pub p_rt_none: f64,
    pub p_rt_out: f64,
    /// fragment tolerance in Da; `ppm_cs` is used when 0
    pub mzd_cs: f64,
    pub ppm_cs: f64,
    pub cs_unknown: f64,
    /// only compare fragment spectra acquired at the same collision energy
    pub ev_filter: bool,
    pub num_threads: usize,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            ppm: 10.0,
            ppm_threshold: None,
            ppm_unknown: None,
            ratio_sd: 0.9,
            ratio_unknown: 0.5,
            p_rt_none: 0.8,
            p_rt_out: 0.4,
            mzd_cs: 0.0,
            ppm_cs: 10.0,
            cs_unknown: 0.7,
            ev_filter: false,
            num_threads: 1,
        }
    }
}

impl ScoringParams {
    pub fn with_ppm(ppm: f64) -> Self {
        Self { ppm, ..Default::default() }
    }

    pub fn ppm_threshold(&self) -> f64 {
        self.ppm_threshold.unwrap_or(2.0 * self.ppm)
    }

    pub fn ppm_unknown(&self) -> f64 {
        self.ppm_unknown.unwrap_or(self.ppm)
    }

    pub fn fragment_tolerance(&self) -> MzTolerance {
        if self.mzd_cs > 0.0 {
            MzTolerance::Da(self.mzd_cs)
        } else {
            MzTolerance::Ppm(self.ppm_cs)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [("ppm", self.ppm), ("ppm_threshold", self.ppm_threshold()), ("ratio_sd", self.ratio_sd)];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(IpaError::validation(format!("{name} must be positive, got {value}")));
            }
        }
        if !(self.ratio_unknown > 0.0) {
            return Err(IpaError::validation(format!(
                "ratio_unknown must be positive, got {}",
                self.ratio_unknown
            )));
        }
        if self.mzd_cs <= 0.0 && !(self.ppm_cs > 0.0) {
            return Err(IpaError::validation("either mzd_cs or ppm_cs must be positive"));
        }
        let probabilities = [("p_rt_none", self.p_rt_none), ("p_rt_out", self.p_rt_out), ("cs_unknown", self.cs_unknown)];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(IpaError::validation(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        Ok(())
    }

    fn mass_sd(&self) -> f64 {
        self.ppm / 2.0
    }

    fn ratio_log_sd(&self) -> f64 {
        (1.0 / self.ratio_sd).sqrt()
    }
}

/// Fragment spectra of the features and the library they are matched against.
#[derive(Clone, Debug, Default)]
pub struct Ms2Evidence<'a> {
    by_feature: HashMap<FeatureId, Vec<&'a Ms2Spectrum>>,
    by_compound: HashMap<&'a str, Vec<&'a ReferenceSpectrum>>,
}

impl<'a> Ms2Evidence<'a> {
    pub fn new(spectra: &'a [Ms2Spectrum], library: &'a [ReferenceSpectrum]) -> Self {
        let mut by_feature: HashMap<FeatureId, Vec<&Ms2Spectrum>> = HashMap::new();
        for spectrum in spectra.iter().filter(|s| !s.spectrum.is_empty()) {
            by_feature.entry(spectrum.feature_id).or_default().push(spectrum);
        }
        let mut by_compound: HashMap<&str, Vec<&ReferenceSpectrum>> = HashMap::new();
        for reference in library.iter().filter(|s| !s.spectrum.is_empty()) {
            by_compound.entry(reference.compound_id.as_str()).or_default().push(reference);
        }
        Ms2Evidence { by_feature, by_compound }
    }

    fn spectra_of(&self, feature_id: FeatureId) -> &[&'a Ms2Spectrum] {
        self.by_feature.get(&feature_id).map_or(&[][..], Vec::as_slice)
    }

    /// best cosine of the acquired spectra against the hypothesis' library
    /// spectra, `None` when the library has nothing comparable
    fn best_cosine(&self, acquired: &[&Ms2Spectrum], hypothesis: &Hypothesis, params: &ScoringParams) -> Option<f64> {
        let references = self.by_compound.get(hypothesis.compound_id.as_str())?;
        let tolerance = params.fragment_tolerance();
        acquired
            .iter()
            .flat_map(|query| {
                references
                    .iter()
                    .filter(move |r| r.matches_adduct(&hypothesis.adduct))
                    .filter(move |r| r.comparable(query.energy, params.ev_filter))
                    .map(move |r| query.spectrum.cosine(&r.spectrum, tolerance).score)
            })
            .reduce(f64::max)
    }
}

/// indices of `hypotheses` sorted by m/z, for range queries
struct MzIndex<'a> {
    hypotheses: &'a [Hypothesis],
    order: Vec<usize>,
}

impl<'a> MzIndex<'a> {
    fn new(hypotheses: &'a [Hypothesis]) -> Self {
        let mut order: Vec<usize> = (0..hypotheses.len()).collect();
        order.sort_by(|&a, &b| hypotheses[a].mz.total_cmp(&hypotheses[b].mz));
        MzIndex { hypotheses, order }
    }

    /// hypotheses with `|mz_h − mz| / mz_h ≤ ppm`, in enumeration order
    fn candidates(&self, mz: f64, ppm: f64, charge: i32) -> Vec<&'a Hypothesis> {
        let lower = mz / (1.0 + ppm * PPM);
        let upper = if ppm * PPM < 1.0 { mz / (1.0 - ppm * PPM) } else { f64::INFINITY };
        let start = self.order.partition_point(|&i| self.hypotheses[i].mz < lower);
        let end = self.order.partition_point(|&i| self.hypotheses[i].mz <= upper);

        let mut found: Vec<&Hypothesis> = self.order[start..end]
            .iter()
            .map(|&i| &self.hypotheses[i])
            .filter(|h| within_ppm(mz, h.mz, ppm))
            .filter(|h| charge == 0 || h.charge.abs() == charge.abs())
            .collect();
        found.sort_by_key(|h| h.index);
        found
    }
}

/// Score every feature group on MS1 evidence only.
pub fn score_ms1(
    groups: &[FeatureGroup],
    hypotheses: &[Hypothesis],
    params: &ScoringParams,
    progress: &dyn ProgressSink,
) -> Result<Vec<AnnotationTable>> {
    score_groups(groups, hypotheses, None, params, progress)
}

/// Score every feature group on MS1 evidence, adding a fragment-spectrum
/// factor for the groups that have MS2 spectra.
pub fn score_msms(
    groups: &[FeatureGroup],
    hypotheses: &[Hypothesis],
    evidence: &Ms2Evidence<'_>,
    params: &ScoringParams,
    progress: &dyn ProgressSink,
) -> Result<Vec<AnnotationTable>> {
    score_groups(groups, hypotheses, Some(evidence), params, progress)
}

fn score_groups(
    groups: &[FeatureGroup],
    hypotheses: &[Hypothesis],
    evidence: Option<&Ms2Evidence<'_>>,
    params: &ScoringParams,
    progress: &dyn ProgressSink,
) -> Result<Vec<AnnotationTable>> {
    params.validate()?;
    progress.started(Phase::Scoring, groups.len());

    let index = MzIndex::new(hypotheses);
    let done = AtomicUsize::new(0);
    let pool = build_thread_pool(params.num_threads)?;
    let tables = pool.install(|| {
        groups
            .par_iter()
            .map(|group| {
                let table = score_group(group, &index, evidence, params);
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                progress.advanced(Phase::Scoring, n, groups.len());
                table
            })
            .collect::<Result<Vec<AnnotationTable>>>()
    })?;

    let annotated = tables.iter().filter(|t| !t.is_unknown_only()).count();
    log::info!("{annotated} of {} feature groups have at least one candidate", groups.len());
    progress.finished(Phase::Scoring);
    Ok(tables)
}

fn rt_factor(hypothesis: &Hypothesis, rt: f64, params: &ScoringParams) -> f64 {
    match &hypothesis.rt_range {
        None => params.p_rt_none,
        Some(range) if range.contains(rt) => 1.0,
        Some(_) => params.p_rt_out,
    }
}

/// `Π_k N(ln(obs_k / exp_k))`, the unknown term wherever nothing is expected
fn isotope_likelihood(group: &FeatureGroup, expected: Option<&[f64]>, params: &ScoringParams) -> Result<f64> {
    let sd = params.ratio_log_sd();
    let unknown = normal_pdf(params.ratio_unknown.ln(), 0.0, sd)?;
    let mut likelihood = 1.0;
    for (shift, observed) in group.isotope_ratios() {
        let expected_ratio = expected.and_then(|e| e.get(shift as usize - 1)).copied().unwrap_or(0.0);
        likelihood *= if expected_ratio > 0.0 && observed > 0.0 {
            normal_pdf((observed / expected_ratio).ln(), 0.0, sd)?
        } else {
            unknown
        };
    }
    Ok(likelihood)
}

fn score_group(
    group: &FeatureGroup,
    index: &MzIndex<'_>,
    evidence: Option<&Ms2Evidence<'_>>,
    params: &ScoringParams,
) -> Result<AnnotationTable> {
    let candidates = index.candidates(group.mz, params.ppm_threshold(), group.charge);
    let acquired = evidence.map_or(&[][..], |e| e.spectra_of(group.feature_id));
    let max_shift = group.isotopes.iter().map(|i| i.shift as usize).max().unwrap_or(0);

    let mut rows: Vec<(AnnotationRow, f64, usize)> = Vec::with_capacity(candidates.len() + 1);
    for hypothesis in candidates {
        let ppm = ppm_error(group.mz, hypothesis.mz);
        let mass = normal_pdf(ppm, 0.0, params.mass_sd())?;
        let rt = rt_factor(hypothesis, group.rt, params);

        let expected = match (&hypothesis.ion_formula, max_shift) {
            (Some(ion), k) if k > 0 => ion.isotope_ratios(k).ok(),
            _ => None,
        };
        let isotope = isotope_likelihood(group, expected.as_deref(), params)?;

        let ms2 = match evidence {
            Some(evidence) if !acquired.is_empty() => {
                Some(evidence.best_cosine(acquired, hypothesis, params).unwrap_or(params.cs_unknown))
            }
            _ => None,
        };

        let weight = mass * rt * isotope * ms2.unwrap_or(1.0);
        let row = AnnotationRow {
            hypothesis: Some(hypothesis.clone()),
            ppm: Some(ppm),
            isotope_score: isotope,
            rt_factor: rt,
            ms2_score: ms2,
            post: 0.0,
            post_gibbs: None,
        };
        rows.push((row, weight, hypothesis.index));
    }

    let unknown_ms2 = (!acquired.is_empty()).then_some(params.cs_unknown);
    let unknown_isotope = isotope_likelihood(group, None, params)?;
    let unknown_weight =
        normal_pdf(params.ppm_unknown(), 0.0, params.mass_sd())? * unknown_isotope * unknown_ms2.unwrap_or(1.0);

    let total: f64 = rows.iter().map(|(_, w, _)| w).sum::<f64>() + unknown_weight;
    let normalise = |w: f64| if total > 0.0 && total.is_finite() { w / total } else { 0.0 };
    let unknown_post = if total > 0.0 && total.is_finite() { unknown_weight / total } else { 1.0 };

    for (row, weight, _) in rows.iter_mut() {
        row.post = normalise(*weight);
    }
    rows.sort_by(|a, b| b.0.post.total_cmp(&a.0.post).then(a.2.cmp(&b.2)));

    let mut table_rows: Vec<AnnotationRow> = rows.into_iter().map(|(row, _, _)| row).collect();
    table_rows.push(AnnotationRow {
        hypothesis: None,
        ppm: None,
        isotope_score: unknown_isotope,
        rt_factor: 1.0,
        ms2_score: unknown_ms2,
        post: unknown_post,
        post_gibbs: None,
    });

    Ok(AnnotationTable { feature_id: group.feature_id, cluster_id: group.cluster_id, rows: table_rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chemistry::sum_formula::SumFormula;
    use crate::data::compound::RtRange;
    use crate::data::feature::IsotopePeak;
    use crate::data::spectrum::MzSpectrum;
    use crate::progress::NoProgress;

    fn hypothesis(index: usize, compound: &str, mz: f64, charge: i32) -> Hypothesis {
        Hypothesis {
            index,
            compound_id: compound.into(),
            name: compound.into(),
            formula: None,
            adduct: "[M+H]+".into(),
            charge,
            mz,
            ion_formula: None,
            rt_range: None,
        }
    }

    fn group(feature_id: FeatureId, mz: f64) -> FeatureGroup {
        FeatureGroup { feature_id, cluster_id: 0, mz, rt: 5.0, intensity: 1000.0, charge: 0, isotopes: vec![] }
    }

    #[test]
    fn test_posteriors_sum_to_one() {
        let hypotheses = vec![
            hypothesis(0, "A", 181.0707, 1),
            hypothesis(1, "B", 181.0712, 1),
            hypothesis(2, "C", 250.0, 1),
        ];
        let groups = vec![group(1, 181.0709), group(2, 400.0)];
        let tables = score_ms1(&groups, &hypotheses, &ScoringParams::default(), &NoProgress).unwrap();

        assert_eq!(tables.len(), 2);
        for table in &tables {
            table.check_normalised(1e-6).unwrap();
            assert!(table.rows.last().is_some_and(AnnotationRow::is_unknown));
        }
        assert_eq!(tables[0].len(), 3);
        assert_eq!(tables[0].rows[0].compound_id(), Some("A"));
        assert!(tables[1].is_unknown_only());
        assert_eq!(tables[1].rows[0].post, 1.0);
    }

    #[test]
    fn test_equal_weights_keep_enumeration_order() {
        let hypotheses = vec![hypothesis(0, "A", 300.0, 1), hypothesis(1, "B", 300.0, 1)];
        let tables = score_ms1(&[group(1, 300.0)], &hypotheses, &ScoringParams::default(), &NoProgress).unwrap();
        assert_eq!(tables[0].rows[0].compound_id(), Some("A"));
        assert_eq!(tables[0].rows[0].post, tables[0].rows[1].post);
    }

    #[test]
    fn test_charge_and_rt_filtering() {
        let mut in_range = hypothesis(0, "A", 300.0, 1);
        in_range.rt_range = Some(RtRange { min: 4.0, max: 6.0 });
        let mut out_of_range = hypothesis(1, "B", 300.0, 1);
        out_of_range.rt_range = Some(RtRange { min: 8.0, max: 9.0 });
        let doubly = hypothesis(2, "C", 300.0, 2);

        let mut charged = group(1, 300.0);
        charged.charge = 1;
        let tables = score_ms1(&[charged], &[in_range, out_of_range, doubly], &ScoringParams::default(), &NoProgress)
            .unwrap();
        let rows = &tables[0].rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].rt_factor, 1.0);
        assert_eq!(rows[1].rt_factor, 0.4);
        assert!((rows[0].post / rows[1].post - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_matching_isotope_ratio_beats_unknown_ratio() {
        let glucose = SumFormula::new("C6H12O6").unwrap();
        let expected = glucose.isotope_ratios(1).unwrap()[0];
        let mut with_formula = hypothesis(0, "glc", 181.0707, 1);
        with_formula.ion_formula = Some(glucose);
        let without_formula = hypothesis(1, "x", 181.0707, 1);

        let mut observed = group(1, 181.0707);
        observed.isotopes.push(IsotopePeak { id: 2, shift: 1, mz: 182.074, intensity: 1000.0 * expected });
        let tables =
            score_ms1(&[observed], &[without_formula, with_formula], &ScoringParams::default(), &NoProgress).unwrap();
        assert_eq!(tables[0].rows[0].compound_id(), Some("glc"));
        assert!(tables[0].rows[0].isotope_score > tables[0].rows[1].isotope_score);
    }

    #[test]
    fn test_msms_cosine_reweights_candidates() {
        let hypotheses = vec![hypothesis(0, "A", 300.0, 1), hypothesis(1, "B", 300.0, 1)];
        let acquired = vec![Ms2Spectrum {
            feature_id: 1,
            energy: None,
            spectrum: MzSpectrum::new(vec![100.0, 150.0], vec![10.0, 5.0]).unwrap(),
        }];
        let library = vec![ReferenceSpectrum {
            compound_id: "B".into(),
            adduct: None,
            energy: None,
            spectrum: MzSpectrum::new(vec![100.0, 150.0], vec![10.0, 5.0]).unwrap(),
        }];
        let evidence = Ms2Evidence::new(&acquired, &library);
        let tables =
            score_msms(&[group(1, 300.0), group(2, 300.0)], &hypotheses, &evidence, &ScoringParams::default(), &NoProgress)
                .unwrap();

        let first = &tables[0].rows;
        assert_eq!(first[0].compound_id(), Some("B"));
        assert!((first[0].ms2_score.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(first[1].ms2_score, Some(0.7));
        tables[0].check_normalised(1e-6).unwrap();

        // no acquired spectrum: MS1 behaviour
        assert!(tables[1].rows.iter().all(|r| r.ms2_score.is_none()));
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let params = ScoringParams { ratio_sd: 0.0, ..Default::default() };
        assert!(score_ms1(&[], &[], &params, &NoProgress).is_err());
        let params = ScoringParams { p_rt_out: 1.5, ..Default::default() };
        assert!(params.validate().is_err());
        assert_eq!(ScoringParams::with_ppm(5.0).ppm_threshold(), 10.0);
    }
}
