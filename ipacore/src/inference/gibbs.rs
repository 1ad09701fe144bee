//! Collapsed Gibbs sampling over the annotation tables.
//!
//! Every feature group is a variable whose value is one row of its table.
//! The full conditional of a group multiplies each row's `post` by a factor
//! that grows with the number of related rows currently assigned elsewhere:
//! other adducts of the same compound within the correlation cluster, or
//! compounds linked in a biochemical network.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithm::utility::build_thread_pool;
use crate::data::annotation::AnnotationTable;
use crate::error::{IpaError, Result};
use crate::inference::relations::{BioNetwork, RelationGraph, RowRef};
use crate::progress::{Phase, ProgressSink};

/// Which relations drive the sampler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerMode {
    #[default]
    #[serde(rename = "adduct")]
    Adduct,
    #[serde(rename = "biochemical")]
    Biochemical,
    #[serde(rename = "biochemical and adduct")]
    BiochemicalAndAdduct,
}

impl SamplerMode {
    pub fn uses_adducts(&self) -> bool {
        matches!(self, SamplerMode::Adduct | SamplerMode::BiochemicalAndAdduct)
    }

    pub fn needs_network(&self) -> bool {
        matches!(self, SamplerMode::Biochemical | SamplerMode::BiochemicalAndAdduct)
    }
}

impl Display for SamplerMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SamplerMode::Adduct => write!(f, "adduct"),
            SamplerMode::Biochemical => write!(f, "biochemical"),
            SamplerMode::BiochemicalAndAdduct => write!(f, "biochemical and adduct"),
        }
    }
}

impl FromStr for SamplerMode {
    type Err = IpaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adduct" => Ok(SamplerMode::Adduct),
            "biochemical" | "bio" => Ok(SamplerMode::Biochemical),
            "biochemical and adduct" | "bio_add" => Ok(SamplerMode::BiochemicalAndAdduct),
            other => Err(IpaError::validation(format!("unsupported gibbs sampler variant `{other}`"))),
        }
    }
}

/// Order in which groups are updated within one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPolicy {
    /// Every group conditions on the previous iteration's assignment, so a
    /// sweep runs in parallel on the worker pool.
    ///
    /// This is not a Gibbs kernel: strongly coupled groups can swap rows in
    /// lockstep and oscillate with period 2 instead of converging. Use it
    /// only for weakly related groups where throughput matters.
    Synchronous,
    /// classical in-place updates, optionally in a shuffled order
    Sequential { shuffle: bool },
}

impl Default for SweepPolicy {
    fn default() -> Self {
        SweepPolicy::Sequential { shuffle: false }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GibbsParams {
    pub iterations: usize,
    /// discarded leading iterations, `iterations / 10` when unset
    pub burn: Option<usize>,
    pub delta_add: f64,
    pub delta_bio: f64,
    /// keep the assignment of every iteration
    pub all_out: bool,
    /// `None` draws a seed from OS entropy
    pub seed: Option<u64>,
    pub sweep: SweepPolicy,
    pub num_threads: usize,
}

impl Default for GibbsParams {
    fn default() -> Self {
        Self {
            iterations: 1000,
            burn: None,
            delta_add: 1.0,
            delta_bio: 1.0,
            all_out: false,
            seed: Some(42),
            sweep: SweepPolicy::default(),
            num_threads: 1,
        }
    }
}

impl GibbsParams {
    pub fn burn(&self) -> usize {
        self.burn.unwrap_or(self.iterations / 10)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(IpaError::validation("gibbs sampler needs at least one iteration"));
        }
        if self.burn() >= self.iterations {
            return Err(IpaError::validation(format!(
                "burn ({}) must be smaller than iterations ({})",
                self.burn(),
                self.iterations
            )));
        }
        for (name, delta) in [("delta_add", self.delta_add), ("delta_bio", self.delta_bio)] {
            if !delta.is_finite() || delta < 0.0 {
                return Err(IpaError::validation(format!("{name} must be non-negative, got {delta}")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GibbsOutput {
    /// input tables with `post Gibbs` filled in
    pub tables: Vec<AnnotationTable>,
    /// row index per group for every iteration, with `all_out`
    pub trace: Option<Vec<Vec<usize>>>,
}

struct Sampler<'a> {
    tables: &'a [AnnotationTable],
    graph: RelationGraph,
    mode: SamplerMode,
    delta_add: f64,
    delta_bio: f64,
}

impl Sampler<'_> {
    fn conditional(&self, group: usize, assignment: &[usize]) -> Vec<f64> {
        self.tables[group]
            .rows
            .iter()
            .enumerate()
            .map(|(row, r)| {
                let (n_add, n_bio) = self.graph.active_counts(RowRef { group, row }, assignment);
                let factor = match self.mode {
                    SamplerMode::Adduct => n_add as f64 + self.delta_add,
                    SamplerMode::Biochemical => n_bio as f64 + self.delta_bio,
                    SamplerMode::BiochemicalAndAdduct => {
                        (n_add as f64 + self.delta_add) * (n_bio as f64 + self.delta_bio)
                    }
                };
                r.post * factor
            })
            .collect()
    }

    /// Draw a row from the full conditional. Falls back to `post` when all
    /// conditional weights vanish, and keeps the current row when `post`
    /// vanishes too.
    fn draw(&self, group: usize, assignment: &[usize], rng: &mut ChaCha8Rng) -> usize {
        if self.tables[group].len() < 2 {
            return 0;
        }
        if let Ok(dist) = WeightedIndex::new(self.conditional(group, assignment)) {
            return dist.sample(rng);
        }
        draw_from_post(&self.tables[group], rng).unwrap_or(assignment[group])
    }
}

fn draw_from_post(table: &AnnotationTable, rng: &mut ChaCha8Rng) -> Option<usize> {
    WeightedIndex::new(table.rows.iter().map(|r| r.post))
        .ok()
        .map(|dist| dist.sample(rng))
}

/// 32 bit words reserved for the draw of one group in one step; a draw takes
/// at most two uniform samples of two words each
const WORDS_PER_DRAW: u128 = 16;

/// stream reserved for the visiting order of shuffled sequential sweeps
const SHUFFLE_STREAM: u64 = u64::MAX;

/// Generator for the draw of `group` at `step` (0 is the initial state).
/// Every group owns a ChaCha stream and every step a fixed block of it, so
/// the draws do not depend on update order or thread scheduling.
fn draw_rng(seed: u64, step: u64, group: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(group as u64);
    rng.set_word_pos(u128::from(step) * WORDS_PER_DRAW);
    rng
}

/// Refine the posteriors of related feature groups jointly.
///
/// Arguments:
///
/// * `tables` - scored annotation tables, one per feature group
/// * `mode` - relations used in the conditionals
/// * `network` - biochemical network, required by the biochemical modes
/// * `params` - sampler parameters
/// * `progress` - receives one event per iteration
///
/// Returns:
///
/// * `Result<GibbsOutput>` - new tables carrying `post Gibbs`, the visit
///   frequency of every row after burn-in
pub fn run_gibbs(
    tables: &[AnnotationTable],
    mode: SamplerMode,
    network: Option<&BioNetwork>,
    params: &GibbsParams,
    progress: &dyn ProgressSink,
) -> Result<GibbsOutput> {
    params.validate()?;
    if mode.needs_network() && network.is_none() {
        return Err(IpaError::validation(format!("{mode} gibbs sampler needs a biochemical network")));
    }
    if let Some(empty) = tables.iter().find(|t| t.is_empty()) {
        return Err(IpaError::data_format(format!("feature {} has an empty annotation table", empty.feature_id)));
    }

    let graph = RelationGraph::build(tables, mode.uses_adducts(), network.filter(|_| mode.needs_network()));
    let (n_add, n_bio) = graph.num_edges();
    log::debug!("gibbs relations: {n_add} adduct edges, {n_bio} biochemical edges");

    let sampler = Sampler { tables, graph, mode, delta_add: params.delta_add, delta_bio: params.delta_bio };
    let seed = params.seed.unwrap_or_else(|| rand::thread_rng().gen());
    let burn = params.burn();
    let n_groups = tables.len();

    // initial state drawn from post
    let mut assignment: Vec<usize> = (0..n_groups)
        .map(|g| {
            let mut rng = draw_rng(seed, 0, g);
            draw_from_post(&tables[g], &mut rng).unwrap_or(0)
        })
        .collect();

    let mut shuffle_rng = ChaCha8Rng::seed_from_u64(seed);
    shuffle_rng.set_stream(SHUFFLE_STREAM);

    let mut counts: Vec<Vec<u64>> = tables.iter().map(|t| vec![0; t.len()]).collect();
    let mut trace = params.all_out.then(|| Vec::with_capacity(params.iterations));
    let pool = build_thread_pool(params.num_threads)?;

    progress.started(Phase::GibbsSampling, params.iterations);
    for iteration in 0..params.iterations {
        let step = iteration as u64 + 1;
        match params.sweep {
            SweepPolicy::Synchronous => {
                let previous = &assignment;
                let next: Vec<usize> = pool.install(|| {
                    (0..n_groups)
                        .into_par_iter()
                        .map(|g| sampler.draw(g, previous, &mut draw_rng(seed, step, g)))
                        .collect()
                });
                assignment = next;
            }
            SweepPolicy::Sequential { shuffle } => {
                let mut order: Vec<usize> = (0..n_groups).collect();
                if shuffle {
                    order.shuffle(&mut shuffle_rng);
                }
                for g in order {
                    assignment[g] = sampler.draw(g, &assignment, &mut draw_rng(seed, step, g));
                }
            }
        }

        if iteration >= burn {
            for (g, &row) in assignment.iter().enumerate() {
                counts[g][row] += 1;
            }
        }
        if let Some(trace) = trace.as_mut() {
            trace.push(assignment.clone());
        }
        progress.advanced(Phase::GibbsSampling, iteration + 1, params.iterations);
    }

    let kept = (params.iterations - burn) as f64;
    let refined = tables
        .iter()
        .zip(&counts)
        .map(|(table, visits)| {
            let frequencies: Vec<f64> = visits.iter().map(|&c| c as f64 / kept).collect();
            table.with_post_gibbs(&frequencies)
        })
        .collect::<Result<Vec<_>>>()?;

    log::info!(
        "{mode} gibbs sampler: {} iterations ({burn} burn-in) over {n_groups} feature groups",
        params.iterations
    );
    progress.finished(Phase::GibbsSampling);
    Ok(GibbsOutput { tables: refined, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::annotation::{AnnotationRow, Hypothesis};
    use crate::progress::NoProgress;

    fn row(compound: Option<&str>, adduct: &str, post: f64) -> AnnotationRow {
        AnnotationRow {
            hypothesis: compound.map(|id| Hypothesis {
                index: 0,
                compound_id: id.into(),
                name: id.into(),
                formula: None,
                adduct: adduct.into(),
                charge: 1,
                mz: 100.0,
                ion_formula: None,
                rt_range: None,
            }),
            ppm: None,
            isotope_score: 1.0,
            rt_factor: 1.0,
            ms2_score: None,
            post,
            post_gibbs: None,
        }
    }

    fn related_tables() -> Vec<AnnotationTable> {
        vec![
            AnnotationTable {
                feature_id: 1,
                cluster_id: 0,
                rows: vec![row(Some("X"), "[M+H]+", 0.45), row(Some("Y"), "[M+H]+", 0.45), row(None, "", 0.1)],
            },
            AnnotationTable {
                feature_id: 2,
                cluster_id: 0,
                rows: vec![row(Some("X"), "[M+Na]+", 0.45), row(Some("Z"), "[M+Na]+", 0.45), row(None, "", 0.1)],
            },
        ]
    }

    #[test]
    fn test_compatible_adduct_is_favoured() {
        let tables = related_tables();
        let params = GibbsParams { iterations: 1000, burn: Some(100), ..Default::default() };
        let output = run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).unwrap();

        let first = &output.tables[0];
        first.check_normalised(1e-9).unwrap();
        let x = first.rows[0].post_gibbs.unwrap();
        let y = first.rows[1].post_gibbs.unwrap();
        assert!(x > y + 0.05, "x = {x}, y = {y}");
        assert_eq!(first.rows[0].post, 0.45);
        assert!(output.trace.is_none());
    }

    #[test]
    fn test_synchronous_sweep_is_reproducible_across_workers() {
        let tables = related_tables();
        let single =
            GibbsParams { iterations: 200, all_out: true, sweep: SweepPolicy::Synchronous, ..Default::default() };
        let parallel = GibbsParams { num_threads: 4, ..single.clone() };
        let a = run_gibbs(&tables, SamplerMode::Adduct, None, &single, &NoProgress).unwrap();
        let b = run_gibbs(&tables, SamplerMode::Adduct, None, &parallel, &NoProgress).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.trace.as_ref().map(Vec::len), Some(200));
    }

    #[test]
    fn test_confident_partner_lifts_compatible_hypothesis() {
        let tables = vec![
            AnnotationTable {
                feature_id: 1,
                cluster_id: 0,
                rows: vec![row(Some("X"), "[M+Na]+", 0.95), row(None, "", 0.05)],
            },
            AnnotationTable {
                feature_id: 2,
                cluster_id: 0,
                rows: vec![row(Some("X"), "[M+H]+", 0.45), row(Some("Y"), "[M+H]+", 0.45), row(None, "", 0.1)],
            },
        ];
        let params = GibbsParams { iterations: 1000, burn: Some(100), ..Default::default() };
        let output = run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).unwrap();

        let ambiguous = &output.tables[1].rows[0];
        assert_eq!(ambiguous.compound_id(), Some("X"));
        let gibbs = ambiguous.post_gibbs.unwrap();
        assert!(gibbs > ambiguous.post, "post Gibbs {gibbs} <= post {}", ambiguous.post);
    }

    #[test]
    fn test_default_sweep_reaches_agreement_of_coupled_groups() {
        // without pseudo-counts a row is only possible next to its partner
        let coupled = |feature_id, adduct| AnnotationTable {
            feature_id,
            cluster_id: 0,
            rows: vec![row(Some("X"), adduct, 0.5), row(Some("Y"), adduct, 0.5), row(None, "", 0.0)],
        };
        let tables = vec![coupled(1, "[M+H]+"), coupled(2, "[M+Na]+")];
        let params = GibbsParams { iterations: 2000, delta_add: 0.0, all_out: true, ..Default::default() };
        let output = run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).unwrap();

        let trace = output.trace.unwrap();
        assert_eq!(trace.len(), 2000);
        assert!(trace.iter().all(|state| state[0] == state[1]));

        let again = run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).unwrap();
        assert_eq!(again.trace.unwrap(), trace);
    }

    #[test]
    fn test_sequential_sweep_normalises() {
        let tables = related_tables();
        let params = GibbsParams {
            iterations: 300,
            sweep: SweepPolicy::Sequential { shuffle: true },
            ..Default::default()
        };
        let output = run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).unwrap();
        for table in &output.tables {
            table.check_normalised(1e-9).unwrap();
        }
    }

    #[test]
    fn test_biochemical_links_are_favoured() {
        let tables = vec![
            AnnotationTable {
                feature_id: 1,
                cluster_id: 0,
                rows: vec![row(Some("A"), "[M+H]+", 0.45), row(Some("B"), "[M+H]+", 0.45), row(None, "", 0.1)],
            },
            AnnotationTable { feature_id: 2, cluster_id: 1, rows: vec![row(Some("C"), "[M+H]+", 0.95), row(None, "", 0.05)] },
        ];
        let network = BioNetwork::new([("B", "C"), ("C", "not annotated")]);
        let params = GibbsParams { delta_bio: 0.1, ..Default::default() };
        let output = run_gibbs(&tables, SamplerMode::Biochemical, Some(&network), &params, &NoProgress).unwrap();
        let rows = &output.tables[0].rows;
        assert!(rows[1].post_gibbs.unwrap() > rows[0].post_gibbs.unwrap());
    }

    #[test]
    fn test_validation() {
        let tables = related_tables();
        let params = GibbsParams { iterations: 100, burn: Some(100), ..Default::default() };
        assert!(run_gibbs(&tables, SamplerMode::Adduct, None, &params, &NoProgress).is_err());
        assert!(run_gibbs(&tables, SamplerMode::Biochemical, None, &GibbsParams::default(), &NoProgress).is_err());
        assert_eq!("biochemical and adduct".parse::<SamplerMode>().unwrap(), SamplerMode::BiochemicalAndAdduct);
        assert_eq!(GibbsParams::default().burn(), 100);
    }

    #[test]
    fn test_unknown_only_tables_stay_put() {
        let tables = vec![AnnotationTable { feature_id: 9, cluster_id: 0, rows: vec![row(None, "", 1.0)] }];
        let output = run_gibbs(&tables, SamplerMode::Adduct, None, &GibbsParams::default(), &NoProgress).unwrap();
        assert_eq!(output.tables[0].rows[0].post_gibbs, Some(1.0));
    }
}
