use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::algorithm::isotope::{generate_isotope_distribution, nominal_isotope_ratios};
use crate::chemistry::elements::{atomic_weights_mono_isotopic, is_known_element};
use crate::error::{IpaError, Result};

/// An elemental composition, e.g. parsed from `C6H12O6`.
///
/// Element counts may become negative after [`SumFormula::subtract`]; such a
/// formula is not chemically valid, see [`SumFormula::is_valid`].
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SumFormula {
    pub elements: BTreeMap<String, i32>,
}

impl SumFormula {
    /// Parse a chemical formula.
    ///
    /// Arguments:
    ///
    /// * `formula` - The chemical formula to parse, e.g. `C6H12O6`.
    ///
    /// Returns:
    ///
    /// * `Result<SumFormula>` - The parsed formula or a `Formula` error naming the offending token.
    ///
    /// # Example
    ///
    /// ```
    /// use ipacore::chemistry::sum_formula::SumFormula;
    ///
    /// let water = SumFormula::new("H2O").unwrap();
    /// assert_eq!(water.elements.get("H"), Some(&2));
    /// assert_eq!(water.elements.get("O"), Some(&1));
    /// ```
    pub fn new(formula: &str) -> Result<Self> {
        let elements = parse_formula(formula)?;
        Ok(SumFormula { elements })
    }

    /// Calculate the monoisotopic weight of the chemical formula.
    ///
    /// # Example
    ///
    /// ```
    /// use ipacore::chemistry::sum_formula::SumFormula;
    ///
    /// let water = SumFormula::new("H2O").unwrap();
    /// assert!((water.monoisotopic_weight() - 18.010564684).abs() < 1e-8);
    /// ```
    pub fn monoisotopic_weight(&self) -> f64 {
        let atomic_weights = atomic_weights_mono_isotopic();
        self.elements.iter().fold(0.0, |acc, (element, count)| {
            acc + atomic_weights.get(element.as_str()).copied().unwrap_or(0.0) * *count as f64
        })
    }

    pub fn is_empty(&self) -> bool {
        self.elements.values().all(|&count| count == 0)
    }

    /// `true` when no element count is negative.
    pub fn is_valid(&self) -> bool {
        self.elements.values().all(|&count| count >= 0)
    }

    pub fn scaled(&self, factor: i32) -> SumFormula {
        let elements = self
            .elements
            .iter()
            .map(|(element, count)| (element.clone(), count * factor))
            .collect();
        SumFormula { elements }
    }

    pub fn add(&self, other: &SumFormula) -> SumFormula {
        let mut elements = self.elements.clone();
        for (element, count) in &other.elements {
            *elements.entry(element.clone()).or_insert(0) += count;
        }
        SumFormula { elements }
    }

    pub fn subtract(&self, other: &SumFormula) -> SumFormula {
        self.add(&other.scaled(-1))
    }

    /// Relative abundance of the `M+1 .. M+max_shift` isotope peaks with
    /// respect to the monoisotopic peak.
    ///
    /// # Example
    ///
    /// ```
    /// use ipacore::chemistry::sum_formula::SumFormula;
    ///
    /// let glucose = SumFormula::new("C6H12O6").unwrap();
    /// let ratios = glucose.isotope_ratios(2).unwrap();
    /// assert!((ratios[0] - 0.067).abs() < 0.005);
    /// ```
    pub fn isotope_ratios(&self, max_shift: usize) -> Result<Vec<f64>> {
        if !self.is_valid() || self.is_empty() {
            return Err(IpaError::Formula {
                formula: self.to_string(),
                reason: "isotope pattern needs a non-empty formula without negative counts".into(),
            });
        }
        let distribution = generate_isotope_distribution(&self.elements, 1e-3, 1e-9, 200)?;
        Ok(nominal_isotope_ratios(&distribution, self.monoisotopic_weight(), max_shift))
    }
}

impl Display for SumFormula {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // Hill order: C, H, then alphabetical
        let mut ordered: Vec<(&String, &i32)> = self.elements.iter().filter(|(_, c)| **c != 0).collect();
        let has_carbon = self.elements.get("C").is_some_and(|&c| c != 0);
        ordered.sort_by_key(|(element, _)| match element.as_str() {
            "C" if has_carbon => (0, String::new()),
            "H" if has_carbon => (1, String::new()),
            other => (2, other.to_string()),
        });
        for (element, count) in ordered {
            if *count == 1 {
                write!(f, "{element}")?;
            } else {
                write!(f, "{element}{count}")?;
            }
        }
        Ok(())
    }
}

/// Parse a chemical formula into a map of elements and their counts.
///
/// Arguments:
///
/// * `formula` - The chemical formula to parse.
///
/// Returns:
///
/// * `Result<BTreeMap<String, i32>>` - A map of elements and their counts.
///
/// # Example
///
/// ```
/// use ipacore::chemistry::sum_formula::parse_formula;
///
/// let elements = parse_formula("CH3COOH").unwrap();
/// assert_eq!(elements.get("C"), Some(&2));
/// assert_eq!(elements.get("H"), Some(&4));
/// assert_eq!(elements.get("O"), Some(&2));
/// ```
pub fn parse_formula(formula: &str) -> Result<BTreeMap<String, i32>> {
    let error = |reason: String| IpaError::Formula { formula: formula.to_string(), reason };

    let mut element_counts = BTreeMap::new();
    let mut chars = formula.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if !c.is_ascii_uppercase() {
            return Err(error(format!("unexpected character `{c}`")));
        }
        let mut element = c.to_string();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_lowercase() {
                element.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let mut digits = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() {
                digits.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let count = if digits.is_empty() {
            1
        } else {
            digits.parse::<i32>().map_err(|e| error(format!("bad count `{digits}`: {e}")))?
        };
        if !is_known_element(&element) {
            return Err(error(format!("unknown element {element}")));
        }
        *element_counts.entry(element).or_insert(0) += count;
    }

    Ok(element_counts)
}
