use serde::{Deserialize, Serialize};

use crate::chemistry::sum_formula::SumFormula;
use crate::data::compound::RtRange;
use crate::data::feature::FeatureId;
use crate::error::{IpaError, Result};

/// A (compound, adduct) pair with its theoretical m/z.
///
/// `index` is the position in enumeration order and breaks ties between
/// equally probable rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub index: usize,
    pub compound_id: String,
    pub name: String,
    pub formula: Option<SumFormula>,
    pub adduct: String,
    pub charge: i32,
    pub mz: f64,
    pub ion_formula: Option<SumFormula>,
    pub rt_range: Option<RtRange>,
}

/// One row of an annotation table. A row without hypothesis is the
/// `unknown` alternative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub hypothesis: Option<Hypothesis>,
    pub ppm: Option<f64>,
    pub isotope_score: f64,
    pub rt_factor: f64,
    pub ms2_score: Option<f64>,
    pub post: f64,
    pub post_gibbs: Option<f64>,
}

impl AnnotationRow {
    pub fn is_unknown(&self) -> bool {
        self.hypothesis.is_none()
    }

    pub fn compound_id(&self) -> Option<&str> {
        self.hypothesis.as_ref().map(|h| h.compound_id.as_str())
    }

    pub fn adduct(&self) -> Option<&str> {
        self.hypothesis.as_ref().map(|h| h.adduct.as_str())
    }

    /// `post Gibbs` once sampled, `post` otherwise
    pub fn probability(&self) -> f64 {
        self.post_gibbs.unwrap_or(self.post)
    }
}

/// Posterior table of one feature group, ordered by descending `post`
/// with the unknown row last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationTable {
    pub feature_id: FeatureId,
    pub cluster_id: usize,
    pub rows: Vec<AnnotationRow>,
}

impl AnnotationTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_unknown_only(&self) -> bool {
        self.rows.iter().all(AnnotationRow::is_unknown)
    }

    pub fn has_post_gibbs(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|r| r.post_gibbs.is_some())
    }

    /// Check that `post`, and `post Gibbs` when present, sum to one.
    pub fn check_normalised(&self, tolerance: f64) -> Result<()> {
        let post: f64 = self.rows.iter().map(|r| r.post).sum();
        if (post - 1.0).abs() > tolerance {
            return Err(IpaError::validation(format!(
                "posteriors of feature {} sum to {post}",
                self.feature_id
            )));
        }
        if self.has_post_gibbs() {
            let gibbs: f64 = self.rows.iter().filter_map(|r| r.post_gibbs).sum();
            if (gibbs - 1.0).abs() > tolerance {
                return Err(IpaError::validation(format!(
                    "gibbs posteriors of feature {} sum to {gibbs}",
                    self.feature_id
                )));
            }
        }
        Ok(())
    }

    /// The row with the highest `post Gibbs` (or `post` before sampling).
    /// Ties go to the earliest row.
    pub fn most_likely(&self) -> Option<&AnnotationRow> {
        let use_gibbs = self.has_post_gibbs();
        let score = |row: &AnnotationRow| if use_gibbs { row.probability() } else { row.post };
        let mut best: Option<&AnnotationRow> = None;
        for row in &self.rows {
            if best.is_none_or(|b| score(row) > score(b)) {
                best = Some(row);
            }
        }
        best
    }

    /// index of the unknown row
    pub fn unknown_index(&self) -> Option<usize> {
        self.rows.iter().position(AnnotationRow::is_unknown)
    }

    /// A copy of this table carrying the given `post Gibbs` values, one per row.
    pub fn with_post_gibbs(&self, post_gibbs: &[f64]) -> Result<AnnotationTable> {
        if post_gibbs.len() != self.rows.len() {
            return Err(IpaError::validation(format!(
                "{} gibbs posteriors for {} rows of feature {}",
                post_gibbs.len(),
                self.rows.len(),
                self.feature_id
            )));
        }
        let rows = self
            .rows
            .iter()
            .zip(post_gibbs)
            .map(|(row, &p)| AnnotationRow { post_gibbs: Some(p), ..row.clone() })
            .collect();
        Ok(AnnotationTable { rows, ..self.clone() })
    }
}
