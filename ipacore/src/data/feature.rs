use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IpaError;

pub type FeatureId = u64;

/// A detected MS1 peak with its intensity in every sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub mz: f64,
    pub rt: f64,
    pub intensities: Vec<f64>,
}

impl Feature {
    pub fn new(id: FeatureId, mz: f64, rt: f64, intensities: Vec<f64>) -> Self {
        Feature { id, mz, rt, intensities }
    }

    /// representative intensity across samples; `NaN` samples are ignored
    pub fn aggregate_intensity(&self, mode: IntensityMode) -> f64 {
        let values = self.intensities.iter().copied().filter(|v| !v.is_nan());
        match mode {
            IntensityMode::Max => values.fold(0.0, f64::max),
            IntensityMode::Average => {
                let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if n == 0 { 0.0 } else { sum / n as f64 }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntensityMode {
    #[default]
    Max,
    #[serde(alias = "mean", alias = "ave")]
    Average,
}

/// A feature after correlation clustering. `cluster_id` is the relative id
/// shared by every feature of one correlation cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteredFeature {
    pub id: FeatureId,
    pub cluster_id: usize,
    pub mz: f64,
    pub rt: f64,
    pub intensity: f64,
}

/// Role of a feature inside its correlation cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    BasePeak,
    IsotopeOfBasePeak,
    PotentialBasePeak,
    IsotopeOfPotentialBasePeak,
}

impl Relationship {
    pub fn is_isotope(&self) -> bool {
        matches!(self, Relationship::IsotopeOfBasePeak | Relationship::IsotopeOfPotentialBasePeak)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Relationship::BasePeak => "bp",
            Relationship::IsotopeOfBasePeak => "bp|isotope",
            Relationship::PotentialBasePeak => "potential bp",
            Relationship::IsotopeOfPotentialBasePeak => "potential bp|isotope",
        }
    }
}

impl Display for Relationship {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Relationship {
    type Err = IpaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "bp" => Ok(Relationship::BasePeak),
            "bp|isotope" => Ok(Relationship::IsotopeOfBasePeak),
            "potential bp" => Ok(Relationship::PotentialBasePeak),
            "potential bp|isotope" => Ok(Relationship::IsotopeOfPotentialBasePeak),
            other => Err(IpaError::data_format(format!("unknown relationship label `{other}`"))),
        }
    }
}

/// A clustered feature with its isotope role.
///
/// `isotope_shift` is `k` of an `M+k` isotope and `parent` the id of the
/// root feature it belongs to. `charge` is signed by the ionisation mode and
/// 0 when no isotope spacing revealed it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappedFeature {
    pub id: FeatureId,
    pub cluster_id: usize,
    pub mz: f64,
    pub rt: f64,
    pub intensity: f64,
    pub relationship: Relationship,
    pub isotope_shift: Option<u32>,
    pub parent: Option<FeatureId>,
    pub charge: i32,
}

impl MappedFeature {
    pub fn isotope_pattern_label(&self) -> String {
        match self.isotope_shift {
            Some(k) => format!("M+{k}"),
            None => String::new(),
        }
    }
}

/// One isotope peak observed next to a root feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsotopePeak {
    pub id: FeatureId,
    pub shift: u32,
    pub mz: f64,
    pub intensity: f64,
}

/// The unit of annotation: a root feature together with its isotopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub feature_id: FeatureId,
    pub cluster_id: usize,
    pub mz: f64,
    pub rt: f64,
    pub intensity: f64,
    pub charge: i32,
    pub isotopes: Vec<IsotopePeak>,
}

impl FeatureGroup {
    /// observed `M+k / M+0` intensity ratios
    pub fn isotope_ratios(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.isotopes.iter().filter(|_| self.intensity > 0.0).map(|iso| (iso.shift, iso.intensity / self.intensity))
    }
}

/// Collect the annotation groups (every root feature plus its isotopes),
/// in input order of the root features.
pub fn feature_groups(features: &[MappedFeature]) -> Vec<FeatureGroup> {
    let mut isotopes: HashMap<FeatureId, Vec<IsotopePeak>> = HashMap::new();
    for feature in features.iter().filter(|f| f.relationship.is_isotope()) {
        if let (Some(parent), Some(shift)) = (feature.parent, feature.isotope_shift) {
            isotopes.entry(parent).or_default().push(IsotopePeak {
                id: feature.id,
                shift,
                mz: feature.mz,
                intensity: feature.intensity,
            });
        }
    }

    features
        .iter()
        .filter(|f| !f.relationship.is_isotope())
        .map(|f| {
            let mut peaks = isotopes.remove(&f.id).unwrap_or_default();
            peaks.sort_by_key(|p| p.shift);
            FeatureGroup {
                feature_id: f.id,
                cluster_id: f.cluster_id,
                mz: f.mz,
                rt: f.rt,
                intensity: f.intensity,
                charge: f.charge,
                isotopes: peaks,
            }
        })
        .collect()
}
