use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::chemistry::sum_formula::SumFormula;
use crate::error::{IpaError, Result};

/// Deserialises from a name (`positive`, `neg`, ...) or a signed integer (`1`, `-1`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "IonisationRepr")]
pub enum IonisationMode {
    Positive,
    Negative,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IonisationRepr {
    Sign(i64),
    Name(String),
}

impl TryFrom<IonisationRepr> for IonisationMode {
    type Error = IpaError;

    fn try_from(repr: IonisationRepr) -> Result<Self> {
        match repr {
            IonisationRepr::Sign(1) => Ok(IonisationMode::Positive),
            IonisationRepr::Sign(-1) => Ok(IonisationMode::Negative),
            IonisationRepr::Sign(other) => Err(IpaError::validation(format!(
                "unsupported ionisation `{other}`, expected 1 or -1"
            ))),
            IonisationRepr::Name(name) => name.parse(),
        }
    }
}

impl IonisationMode {
    pub fn sign(&self) -> i32 {
        match self {
            IonisationMode::Positive => 1,
            IonisationMode::Negative => -1,
        }
    }
}

impl Display for IonisationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IonisationMode::Positive => write!(f, "positive"),
            IonisationMode::Negative => write!(f, "negative"),
        }
    }
}

impl FromStr for IonisationMode {
    type Err = IpaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" | "pos" | "+" | "1" | "+1" => Ok(IonisationMode::Positive),
            "negative" | "neg" | "-" | "-1" => Ok(IonisationMode::Negative),
            other => Err(IpaError::validation(format!(
                "unsupported ionisation `{other}`, expected positive or negative"
            ))),
        }
    }
}

/// Expected retention-time window of a compound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RtRange {
    pub min: f64,
    pub max: f64,
}

impl RtRange {
    pub fn contains(&self, rt: f64) -> bool {
        self.min <= rt && rt <= self.max
    }
}

/// A reference compound. Rows without a mass are kept so that the
/// enumerator can count and skip them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Compound {
    pub id: String,
    pub name: String,
    pub formula: Option<SumFormula>,
    pub mass: Option<f64>,
    pub rt_range: Option<RtRange>,
    /// adduct names allowed for this compound, all adducts when `None`
    pub adducts: Option<Vec<String>>,
}

impl Compound {
    pub fn new(id: impl Into<String>, name: impl Into<String>, formula: Option<SumFormula>, mass: Option<f64>) -> Self {
        Compound {
            id: id.into(),
            name: name.into(),
            formula,
            mass: mass.filter(|m| m.is_finite()),
            rt_range: None,
            adducts: None,
        }
    }

    pub fn with_rt_range(mut self, min: f64, max: f64) -> Self {
        self.rt_range = Some(RtRange { min: min.min(max), max: min.max(max) });
        self
    }

    pub fn with_adducts(mut self, adducts: Vec<String>) -> Self {
        self.adducts = Some(adducts);
        self
    }

    pub fn allows_adduct(&self, adduct: &str) -> bool {
        self.adducts
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|a| a == adduct))
    }
}

static ADDUCT_CHARGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\](\d*)([+-])$").expect("adduct charge pattern compiles"));

/// Read the signed charge from adduct notation such as `[M+2H]2+` or `[M-H]-`.
///
/// # Examples
///
/// ```
/// use ipacore::data::compound::charge_from_adduct_name;
///
/// assert_eq!(charge_from_adduct_name("[M+2H]2+"), Some(2));
/// assert_eq!(charge_from_adduct_name("[M-H]-"), Some(-1));
/// assert_eq!(charge_from_adduct_name("M+H"), None);
/// ```
pub fn charge_from_adduct_name(name: &str) -> Option<i32> {
    let captures = ADDUCT_CHARGE.captures(name.trim())?;
    let magnitude = match captures.get(1).map(|m| m.as_str()).unwrap_or("") {
        "" => 1,
        digits => digits.parse::<i32>().ok()?,
    };
    let sign = if &captures[2] == "+" { 1 } else { -1 };
    Some(sign * magnitude)
}

/// An adduct rule, e.g. `[2M+Na]+`: multiplicity 2, charge +1, mass delta
/// of a sodium cation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdductRule {
    pub name: String,
    /// derived from the formulas when `None`
    pub mass_delta: Option<f64>,
    /// signed charge, never 0
    pub charge: i32,
    pub multiplicity: u32,
    pub ionisation: IonisationMode,
    pub formula_add: Option<SumFormula>,
    pub formula_ded: Option<SumFormula>,
}

impl AdductRule {
    /// Validate and build a rule.
    ///
    /// `charge` may be given unsigned, it is then signed by `ionisation`;
    /// a signed charge that contradicts `ionisation` is rejected, as is 0.
    pub fn new(
        name: impl Into<String>,
        mass_delta: f64,
        charge: i32,
        multiplicity: u32,
        ionisation: IonisationMode,
    ) -> Result<Self> {
        let name = name.into();
        if !mass_delta.is_finite() {
            return Err(IpaError::validation(format!("adduct `{name}` has no finite mass delta")));
        }
        Self::checked(name, Some(mass_delta), charge, multiplicity, ionisation)
    }

    /// A rule whose mass delta follows from the atoms it adds and removes.
    pub fn from_formulas(
        name: impl Into<String>,
        charge: i32,
        multiplicity: u32,
        ionisation: IonisationMode,
        add: Option<SumFormula>,
        ded: Option<SumFormula>,
    ) -> Result<Self> {
        let name = name.into();
        let rule = Self::checked(name, None, charge, multiplicity, ionisation)?.with_formulas(add, ded);
        if rule.formula_add.is_none() && rule.formula_ded.is_none() {
            return Err(IpaError::validation(format!(
                "adduct `{}` has neither a mass delta nor formulas",
                rule.name
            )));
        }
        Ok(rule)
    }

    fn checked(
        name: String,
        mass_delta: Option<f64>,
        charge: i32,
        multiplicity: u32,
        ionisation: IonisationMode,
    ) -> Result<Self> {
        if charge == 0 {
            return Err(IpaError::validation(format!("adduct `{name}` has charge 0")));
        }
        // positive values are read as unsigned magnitudes
        if charge < 0 && ionisation == IonisationMode::Positive {
            return Err(IpaError::validation(format!(
                "adduct `{name}` has charge {charge} but ionisation {ionisation}"
            )));
        }
        if multiplicity == 0 {
            return Err(IpaError::validation(format!("adduct `{name}` has multiplicity 0")));
        }
        Ok(AdductRule {
            name,
            mass_delta,
            charge: charge.abs() * ionisation.sign(),
            multiplicity,
            ionisation,
            formula_add: None,
            formula_ded: None,
        })
    }

    pub fn with_formulas(mut self, add: Option<SumFormula>, ded: Option<SumFormula>) -> Self {
        self.formula_add = add.filter(|f| !f.is_empty());
        self.formula_ded = ded.filter(|f| !f.is_empty());
        self
    }

    /// Mass added to `n·M`: the explicit delta, or
    /// `mass(add) − mass(ded) − z·electron_mass`.
    pub fn resolved_mass_delta(&self, electron_mass: f64) -> f64 {
        self.mass_delta.unwrap_or_else(|| {
            let add = self.formula_add.as_ref().map_or(0.0, SumFormula::monoisotopic_weight);
            let ded = self.formula_ded.as_ref().map_or(0.0, SumFormula::monoisotopic_weight);
            add - ded - self.charge as f64 * electron_mass
        })
    }

    /// theoretical m/z of this adduct of a neutral mass
    ///
    /// # Examples
    ///
    /// ```
    /// use ipacore::chemistry::constants::MASS_ELECTRON;
    /// use ipacore::chemistry::sum_formula::SumFormula;
    /// use ipacore::data::compound::{AdductRule, IonisationMode};
    ///
    /// let rule = AdductRule::new("[M+2H]2+", 2.014552, 2, 1, IonisationMode::Positive).unwrap();
    /// assert!((rule.mz(180.063388, MASS_ELECTRON) - 91.03897).abs() < 1e-5);
    ///
    /// let hydrogen = SumFormula::new("H").unwrap();
    /// let deprotonated =
    ///     AdductRule::from_formulas("[M-H]-", 1, 1, IonisationMode::Negative, None, Some(hydrogen)).unwrap();
    /// assert!((deprotonated.mz(180.063388, MASS_ELECTRON) - 179.056112).abs() < 1e-5);
    /// ```
    pub fn mz(&self, neutral_mass: f64, electron_mass: f64) -> f64 {
        (self.multiplicity as f64 * neutral_mass + self.resolved_mass_delta(electron_mass))
            / self.charge.unsigned_abs() as f64
    }

    /// formula of the ion `n·M + add − ded`, may carry negative counts
    pub fn ion_formula(&self, compound: &SumFormula) -> SumFormula {
        let mut ion = compound.scaled(self.multiplicity as i32);
        if let Some(add) = &self.formula_add {
            ion = ion.add(add);
        }
        if let Some(ded) = &self.formula_ded {
            ion = ion.subtract(ded);
        }
        ion
    }

    pub fn has_formulas(&self) -> bool {
        self.formula_add.is_some() || self.formula_ded.is_some()
    }
}
