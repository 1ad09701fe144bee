use std::collections::HashMap;

use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algorithm::utility::build_thread_pool;
use crate::data::feature::{ClusteredFeature, Feature, IntensityMode};
use crate::error::{IpaError, Result};
use crate::progress::{Phase, ProgressSink};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringParams {
    /// minimum Pearson correlation of two sample profiles (exclusive)
    pub correlation_threshold: f64,
    /// maximum retention-time distance of two linked features (exclusive)
    pub rt_window: f64,
    pub intensity_mode: IntensityMode,
    pub num_threads: usize,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            correlation_threshold: 0.8,
            rt_window: 1.0,
            intensity_mode: IntensityMode::Max,
            num_threads: 1,
        }
    }
}

impl ClusteringParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.rt_window > 0.0) {
            return Err(IpaError::validation(format!("rt_window must be positive, got {}", self.rt_window)));
        }
        if !self.correlation_threshold.is_finite() {
            return Err(IpaError::validation("correlation_threshold must be finite"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Union-find
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Dsu {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), size: vec![1; n] }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = self.parent[x];
        while root != self.parent[root] {
            root = self.parent[root];
        }
        // path compression
        while x != self.parent[x] {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let mut ra = self.find(a);
        let mut rb = self.find(b);
        if ra == rb {
            return false;
        }
        // union by size
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    /// Component label per element, numbered from 0 in order of each
    /// component's first element.
    fn component_labels(mut self) -> Vec<usize> {
        let mut label_of_root: HashMap<usize, usize> = HashMap::new();
        (0..self.parent.len())
            .map(|i| {
                let root = self.find(i);
                let next = label_of_root.len();
                *label_of_root.entry(root).or_insert(next)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// centered, unit-length profile; `None` for a constant profile
fn standardized_profile(intensities: &[f64]) -> Option<DVector<f64>> {
    let profile = DVector::from_iterator(
        intensities.len(),
        intensities.iter().map(|v| if v.is_nan() { 0.0 } else { *v }),
    );
    let centered = profile.add_scalar(-profile.mean());
    let norm = centered.norm();
    if norm > 0.0 && norm.is_finite() {
        Some(centered / norm)
    } else {
        None
    }
}

/// Pearson correlation of two standardized profiles, 0 when either is constant
fn pearson(a: &Option<DVector<f64>>, b: &Option<DVector<f64>>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => a.dot(b),
        _ => 0.0,
    }
}

fn check_profiles(features: &[Feature]) -> Result<usize> {
    let n_samples = features.first().map(|f| f.intensities.len()).unwrap_or(0);
    if n_samples == 0 {
        return Err(IpaError::data_format("features carry no sample intensities"));
    }
    if let Some(bad) = features.iter().find(|f| f.intensities.len() != n_samples) {
        return Err(IpaError::data_format(format!(
            "feature {} has {} sample intensities, expected {n_samples}",
            bad.id,
            bad.intensities.len()
        )));
    }
    Ok(n_samples)
}

/// Group features whose sample profiles correlate above the threshold and
/// whose retention times lie within the window. Clusters are the connected
/// components of that similarity graph.
///
/// Arguments:
///
/// * `features` - raw features, all with the same number of samples
/// * `params` - clustering parameters
/// * `progress` - receives clustering progress events
///
/// Returns:
///
/// * `Result<Vec<ClusteredFeature>>` - one entry per input feature, in input order
pub fn cluster_features(
    features: &[Feature],
    params: &ClusteringParams,
    progress: &dyn ProgressSink,
) -> Result<Vec<ClusteredFeature>> {
    params.validate()?;
    if features.is_empty() {
        return Ok(Vec::new());
    }
    let n_samples = check_profiles(features)?;
    progress.started(Phase::Clustering, features.len());

    let profiles: Vec<Option<DVector<f64>>> =
        features.iter().map(|f| standardized_profile(&f.intensities)).collect();
    if n_samples < 2 {
        log::warn!("single-sample input, every feature becomes its own cluster");
    }

    let mut order: Vec<usize> = (0..features.len()).collect();
    order.sort_by(|&a, &b| features[a].rt.total_cmp(&features[b].rt));

    let pool = build_thread_pool(params.num_threads)?;
    let edges: Vec<(usize, usize)> = pool.install(|| {
        order
            .par_iter()
            .enumerate()
            .flat_map_iter(|(pos, &i)| {
                let rt_i = features[i].rt;
                order[pos + 1..]
                    .iter()
                    .take_while(move |&&j| features[j].rt - rt_i < params.rt_window)
                    .filter(|&&j| pearson(&profiles[i], &profiles[j]) > params.correlation_threshold)
                    .map(move |&j| (i, j))
                    .collect::<Vec<_>>()
            })
            .collect()
    });
    progress.advanced(Phase::Clustering, features.len(), features.len());

    let mut dsu = Dsu::new(features.len());
    for &(i, j) in &edges {
        dsu.union(i, j);
    }
    let labels = dsu.component_labels();

    let clustered = assemble(features, &labels, params.intensity_mode);
    let n_clusters = labels.iter().max().map_or(0, |m| m + 1);
    log::info!(
        "clustered {} features into {n_clusters} clusters ({} correlated pairs)",
        features.len(),
        edges.len()
    );
    progress.finished(Phase::Clustering);
    Ok(clustered)
}

/// Skip correlation clustering, every feature forms its own cluster.
pub fn singletons(features: &[Feature], intensity_mode: IntensityMode) -> Vec<ClusteredFeature> {
    let labels: Vec<usize> = (0..features.len()).collect();
    assemble(features, &labels, intensity_mode)
}

/// Use relative ids already present in the input instead of clustering.
pub fn from_relative_ids(
    features: &[Feature],
    relative_ids: &[usize],
    intensity_mode: IntensityMode,
) -> Result<Vec<ClusteredFeature>> {
    if relative_ids.len() != features.len() {
        return Err(IpaError::data_format(format!(
            "{} relative ids for {} features",
            relative_ids.len(),
            features.len()
        )));
    }
    Ok(assemble(features, relative_ids, intensity_mode))
}

fn assemble(features: &[Feature], labels: &[usize], intensity_mode: IntensityMode) -> Vec<ClusteredFeature> {
    features
        .iter()
        .zip(labels)
        .map(|(f, &cluster_id)| ClusteredFeature {
            id: f.id,
            cluster_id,
            mz: f.mz,
            rt: f.rt,
            intensity: f.aggregate_intensity(intensity_mode),
        })
        .collect()
}
