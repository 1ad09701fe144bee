use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use itertools::{izip, Itertools};
use serde::{Deserialize, Serialize};

use crate::algorithm::similarity::{cosine_similarity, CosineMatch, MzTolerance};
use crate::data::feature::FeatureId;
use crate::error::{IpaError, Result};

/// Represents a centroided mass spectrum with associated m/z values and intensities.
///
/// Uses Arc<Vec<T>> for efficient cloning, the same reference spectrum is
/// compared against many feature groups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MzSpectrum {
    pub mz: Arc<Vec<f64>>,
    pub intensity: Arc<Vec<f64>>,
}

impl MzSpectrum {
    /// Constructs a new `MzSpectrum`, peaks sorted by m/z.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use ipacore::data::spectrum::MzSpectrum;
    /// let spectrum = MzSpectrum::new(vec![200.0, 100.0], vec![20.0, 10.0]).unwrap();
    /// assert_eq!(*spectrum.mz, vec![100.0, 200.0]);
    /// assert_eq!(*spectrum.intensity, vec![10.0, 20.0]);
    /// ```
    pub fn new(mz: Vec<f64>, intensity: Vec<f64>) -> Result<Self> {
        if mz.len() != intensity.len() {
            return Err(IpaError::data_format(format!(
                "spectrum has {} m/z values but {} intensities",
                mz.len(),
                intensity.len()
            )));
        }
        let (mz, intensity) = izip!(mz, intensity).sorted_by(|a, b| a.0.total_cmp(&b.0)).unzip();
        Ok(MzSpectrum {
            mz: Arc::new(mz),
            intensity: Arc::new(intensity),
        })
    }

    pub fn len(&self) -> usize {
        self.mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty()
    }

    pub fn cosine(&self, other: &MzSpectrum, tolerance: MzTolerance) -> CosineMatch {
        cosine_similarity(&self.mz, &self.intensity, &other.mz, &other.intensity, tolerance)
    }
}

/// Peak lists are written as `"mz:intensity mz:intensity ..."`.
impl FromStr for MzSpectrum {
    type Err = IpaError;

    fn from_str(s: &str) -> Result<Self> {
        let mut mz = Vec::new();
        let mut intensity = Vec::new();
        for token in s.split_whitespace() {
            let (m, i) = token
                .split_once(':')
                .ok_or_else(|| IpaError::data_format(format!("peak `{token}` is not of the form mz:intensity")))?;
            let parse = |value: &str| {
                value
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| IpaError::data_format(format!("peak `{token}`: {e}")))
            };
            mz.push(parse(m)?);
            intensity.push(parse(i)?);
        }
        MzSpectrum::new(mz, intensity)
    }
}

impl Display for MzSpectrum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let peaks = izip!(self.mz.iter(), self.intensity.iter()).map(|(mz, intensity)| format!("{mz}:{intensity}"));
        write!(f, "{}", peaks.format(" "))
    }
}

/// An acquired fragment spectrum of one MS1 feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ms2Spectrum {
    pub feature_id: FeatureId,
    pub energy: Option<f64>,
    pub spectrum: MzSpectrum,
}

/// A library fragment spectrum of a compound, optionally for one adduct.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSpectrum {
    pub compound_id: String,
    pub adduct: Option<String>,
    pub energy: Option<f64>,
    pub spectrum: MzSpectrum,
}

impl ReferenceSpectrum {
    /// whether this library entry may be compared with a spectrum acquired at `energy`
    pub fn comparable(&self, energy: Option<f64>, filter_energy: bool) -> bool {
        if !filter_energy {
            return true;
        }
        match (self.energy, energy) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-9,
            _ => false,
        }
    }

    pub fn matches_adduct(&self, adduct: &str) -> bool {
        self.adduct.as_deref().is_none_or(|a| a.is_empty() || a == adduct)
    }
}
