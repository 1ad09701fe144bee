use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithm::utility::build_thread_pool;
use crate::chemistry::constants::MASS_ELECTRON;
use crate::data::annotation::Hypothesis;
use crate::data::compound::{AdductRule, Compound, IonisationMode};
use crate::error::{IpaError, Result};
use crate::progress::{Phase, ProgressSink};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationParams {
    pub electron_mass: f64,
    pub num_threads: usize,
}

impl Default for EnumerationParams {
    fn default() -> Self {
        Self { electron_mass: MASS_ELECTRON, num_threads: 1 }
    }
}

/// What the enumerator skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationReport {
    pub compounds: usize,
    pub rules_used: usize,
    pub rules_skipped: usize,
    pub missing_mass: usize,
    pub invalid_ion_formula: usize,
    pub hypotheses: usize,
}

/// Hypotheses of one compound, before global indices are assigned.
struct CompoundHypotheses {
    hypotheses: Vec<Hypothesis>,
    invalid: usize,
}

fn expand_compound(compound: &Compound, mass: f64, rules: &[&AdductRule], electron_mass: f64) -> CompoundHypotheses {
    let mut hypotheses = Vec::with_capacity(rules.len());
    let mut invalid = 0;

    for rule in rules.iter().filter(|r| compound.allows_adduct(&r.name)) {
        let ion_formula = compound.formula.as_ref().map(|f| rule.ion_formula(f));
        if ion_formula.as_ref().is_some_and(|ion| !ion.is_valid()) {
            log::debug!("skipping {} {}: ion formula has negative counts", compound.id, rule.name);
            invalid += 1;
            continue;
        }
        let mz = rule.mz(mass, electron_mass);
        if !(mz > 0.0) || !mz.is_finite() {
            invalid += 1;
            continue;
        }
        hypotheses.push(Hypothesis {
            index: 0,
            compound_id: compound.id.clone(),
            name: compound.name.clone(),
            formula: compound.formula.clone(),
            adduct: rule.name.clone(),
            charge: rule.charge,
            mz,
            ion_formula,
            rt_range: compound.rt_range,
        });
    }
    CompoundHypotheses { hypotheses, invalid }
}

/// Compute every chemically valid (compound, adduct) hypothesis for an
/// ionisation mode.
///
/// For compound mass `M` and rule `(Δ, z, n)` the theoretical m/z is
/// `(n·M + Δ) / |z|`. Rules of the other ionisation mode are skipped, as are
/// compounds without mass and pairs whose ion formula would need negative
/// element counts. The result is compound-major with rules in table order,
/// independent of `num_threads`.
///
/// Arguments:
///
/// * `rules` - validated adduct rules
/// * `compounds` - compound database
/// * `ionisation` - acquisition mode
/// * `params` - electron mass and worker count
/// * `progress` - receives enumeration progress events
///
/// Returns:
///
/// * `Result<(Vec<Hypothesis>, EnumerationReport)>` - hypotheses indexed in enumeration order
pub fn enumerate_adducts(
    rules: &[AdductRule],
    compounds: &[Compound],
    ionisation: IonisationMode,
    params: &EnumerationParams,
    progress: &dyn ProgressSink,
) -> Result<(Vec<Hypothesis>, EnumerationReport)> {
    if !params.electron_mass.is_finite() || params.electron_mass < 0.0 {
        return Err(IpaError::validation(format!(
            "electron mass must be non-negative, got {}",
            params.electron_mass
        )));
    }

    let active: Vec<&AdductRule> = rules.iter().filter(|r| r.ionisation == ionisation).collect();
    let mut report = EnumerationReport {
        compounds: compounds.len(),
        rules_used: active.len(),
        rules_skipped: rules.len() - active.len(),
        ..Default::default()
    };
    if report.rules_skipped > 0 {
        log::debug!("{} adduct rules do not match {ionisation} ionisation", report.rules_skipped);
    }
    if active.is_empty() {
        log::warn!("no adduct rule for {ionisation} ionisation");
    }

    progress.started(Phase::AdductEnumeration, compounds.len());
    let pool = build_thread_pool(params.num_threads)?;
    let per_compound: Vec<Option<CompoundHypotheses>> = pool.install(|| {
        compounds
            .par_iter()
            .map(|compound| {
                compound
                    .mass
                    .map(|mass| expand_compound(compound, mass, &active, params.electron_mass))
            })
            .collect()
    });

    let mut hypotheses = Vec::new();
    for expanded in per_compound {
        match expanded {
            Some(expanded) => {
                report.invalid_ion_formula += expanded.invalid;
                hypotheses.extend(expanded.hypotheses);
            }
            None => report.missing_mass += 1,
        }
    }
    for (index, hypothesis) in hypotheses.iter_mut().enumerate() {
        hypothesis.index = index;
    }
    report.hypotheses = hypotheses.len();

    if report.missing_mass > 0 {
        log::warn!("{} compounds without mass were skipped", report.missing_mass);
    }
    if report.invalid_ion_formula > 0 {
        log::warn!("{} compound/adduct pairs were chemically invalid", report.invalid_ion_formula);
    }
    log::info!(
        "enumerated {} hypotheses from {} compounds and {} adduct rules",
        report.hypotheses,
        report.compounds,
        report.rules_used
    );
    progress.advanced(Phase::AdductEnumeration, compounds.len(), compounds.len());
    progress.finished(Phase::AdductEnumeration);
    Ok((hypotheses, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chemistry::sum_formula::SumFormula;
    use crate::progress::NoProgress;

    fn rules() -> Vec<AdductRule> {
        vec![
            AdductRule::new("[M+H]+", 1.007276, 1, 1, IonisationMode::Positive).unwrap(),
            AdductRule::new("[M+2H]2+", 2.014552, 2, 1, IonisationMode::Positive).unwrap(),
            AdductRule::new("[M-H]-", -1.007276, 1, 1, IonisationMode::Negative).unwrap(),
            AdductRule::from_formulas(
                "[M-H2O+H]+",
                1,
                1,
                IonisationMode::Positive,
                Some(SumFormula::new("H").unwrap()),
                Some(SumFormula::new("H2O").unwrap()),
            )
            .unwrap(),
        ]
    }

    fn compounds() -> Vec<Compound> {
        vec![
            Compound::new("C1", "glucose", Some(SumFormula::new("C6H12O6").unwrap()), Some(180.063388)),
            Compound::new("C2", "unknown mass", None, None),
            // no oxygen to lose
            Compound::new("C3", "benzene", Some(SumFormula::new("C6H6").unwrap()), Some(78.04695)),
        ]
    }

    #[test]
    fn test_enumeration_order_and_mz() {
        let (hypotheses, report) = enumerate_adducts(
            &rules(),
            &compounds(),
            IonisationMode::Positive,
            &EnumerationParams::default(),
            &NoProgress,
        )
        .unwrap();

        let names: Vec<(&str, &str)> =
            hypotheses.iter().map(|h| (h.compound_id.as_str(), h.adduct.as_str())).collect();
        assert_eq!(
            names,
            vec![
                ("C1", "[M+H]+"),
                ("C1", "[M+2H]2+"),
                ("C1", "[M-H2O+H]+"),
                ("C3", "[M+H]+"),
                ("C3", "[M+2H]2+"),
            ]
        );
        assert!((hypotheses[0].mz - 181.070664).abs() < 1e-6);
        assert!((hypotheses[1].mz - 91.03897).abs() < 1e-5);
        assert_eq!(hypotheses.iter().map(|h| h.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(report.missing_mass, 1);
        assert_eq!(report.invalid_ion_formula, 1);
        assert_eq!(report.rules_skipped, 1);
    }

    #[test]
    fn test_enumeration_is_idempotent_across_workers() {
        let single = enumerate_adducts(
            &rules(),
            &compounds(),
            IonisationMode::Positive,
            &EnumerationParams::default(),
            &NoProgress,
        )
        .unwrap();
        let parallel = enumerate_adducts(
            &rules(),
            &compounds(),
            IonisationMode::Positive,
            &EnumerationParams { num_threads: 4, ..Default::default() },
            &NoProgress,
        )
        .unwrap();
        assert_eq!(single, parallel);
    }

    #[test]
    fn test_missing_mass_only_database() {
        let compounds = vec![Compound::new("C2", "no mass", None, None)];
        let (hypotheses, report) = enumerate_adducts(
            &rules(),
            &compounds,
            IonisationMode::Negative,
            &EnumerationParams::default(),
            &NoProgress,
        )
        .unwrap();
        assert!(hypotheses.is_empty());
        assert_eq!(report.missing_mass, 1);
    }

    #[test]
    fn test_compound_adduct_whitelist() {
        let compounds = vec![Compound::new("C1", "glucose", None, Some(180.063388))
            .with_adducts(vec!["[M+2H]2+".to_string()])];
        let (hypotheses, _) = enumerate_adducts(
            &rules(),
            &compounds,
            IonisationMode::Positive,
            &EnumerationParams::default(),
            &NoProgress,
        )
        .unwrap();
        assert_eq!(hypotheses.len(), 1);
        assert_eq!(hypotheses[0].charge, 2);
    }
}
