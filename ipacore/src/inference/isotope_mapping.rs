use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chemistry::constants::PPM;
use crate::data::compound::IonisationMode;
use crate::data::feature::{ClusteredFeature, FeatureId, MappedFeature, Relationship};
use crate::error::{IpaError, Result};
use crate::progress::{Phase, ProgressSink};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsotopeParams {
    /// spacing of consecutive isotope peaks at charge 1
    pub isotope_mass_difference: f64,
    pub ppm: f64,
    /// minimum `intensity(isotope) / intensity(parent)`
    pub min_isotope_ratio: f64,
    pub max_charge: u32,
    pub max_isotope: u32,
}

impl Default for IsotopeParams {
    fn default() -> Self {
        Self {
            isotope_mass_difference: 1.0,
            ppm: 100.0,
            min_isotope_ratio: 0.5,
            max_charge: 3,
            max_isotope: 3,
        }
    }
}

impl IsotopeParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.isotope_mass_difference > 0.0) || !(self.ppm > 0.0) {
            return Err(IpaError::validation(format!(
                "isotope spacing ({}) and ppm ({}) must be positive",
                self.isotope_mass_difference, self.ppm
            )));
        }
        if self.max_charge == 0 || self.max_isotope == 0 {
            return Err(IpaError::validation("max_charge and max_isotope must be at least 1"));
        }
        Ok(())
    }

    /// smallest `(k, z)` whose spacing `k · d / z` explains `delta`
    fn isotope_step(&self, delta: f64, heavy_mz: f64, required_charge: Option<u32>) -> Option<(u32, u32)> {
        let tolerance = self.ppm * heavy_mz * PPM;
        (1..=self.max_isotope)
            .flat_map(|k| (1..=self.max_charge).map(move |z| (k, z)))
            .filter(|&(_, z)| required_charge.is_none_or(|c| c == z))
            .find(|&(k, z)| (delta - k as f64 * self.isotope_mass_difference / z as f64).abs() <= tolerance)
    }
}

#[derive(Clone, Copy, Debug)]
enum Role {
    Root { charge: Option<u32> },
    Isotope { parent: usize, shift: u32, charge: u32 },
}

/// Find isotope envelopes inside every correlation cluster and label each
/// feature `bp`, `bp|isotope`, `potential bp` or `potential bp|isotope`.
///
/// Within a cluster features are visited by ascending m/z. A heavier feature
/// is an isotope of a lighter root feature when their m/z difference matches
/// `k · isotope_mass_difference / z` within `ppm` and its intensity is at
/// least `min_isotope_ratio` times the root's. Among several fitting roots
/// the most intense one becomes the parent.
///
/// Returns one mapped feature per input feature, in input order.
pub fn map_isotope_patterns(
    features: &[ClusteredFeature],
    ionisation: IonisationMode,
    params: &IsotopeParams,
    progress: &dyn ProgressSink,
) -> Result<Vec<MappedFeature>> {
    params.validate()?;

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, feature) in features.iter().enumerate() {
        clusters.entry(feature.cluster_id).or_default().push(index);
    }
    progress.started(Phase::IsotopeMapping, clusters.len());

    let mut roles: Vec<Role> = vec![Role::Root { charge: None }; features.len()];
    let mut base_peaks: Vec<usize> = Vec::with_capacity(clusters.len());

    for (done, members) in clusters.values().enumerate() {
        let mut by_mz = members.clone();
        by_mz.sort_by(|&a, &b| features[a].mz.total_cmp(&features[b].mz).then(a.cmp(&b)));

        for (pos, &heavy) in by_mz.iter().enumerate() {
            let mut best: Option<(usize, u32, u32)> = None;
            for &light in &by_mz[..pos] {
                let Role::Root { charge } = roles[light] else {
                    continue;
                };
                let (f_light, f_heavy) = (&features[light], &features[heavy]);
                if f_light.intensity <= 0.0 || f_heavy.intensity / f_light.intensity < params.min_isotope_ratio {
                    continue;
                }
                let Some((shift, z)) = params.isotope_step(f_heavy.mz - f_light.mz, f_heavy.mz, charge) else {
                    continue;
                };
                if best.is_none_or(|(b, _, _)| f_light.intensity > features[b].intensity) {
                    best = Some((light, shift, z));
                }
            }
            if let Some((parent, shift, charge)) = best {
                roles[heavy] = Role::Isotope { parent, shift, charge };
                roles[parent] = Role::Root { charge: Some(charge) };
            }
        }

        // most intense root, first in input order on ties
        let mut base_peak: Option<usize> = None;
        for &index in members {
            if matches!(roles[index], Role::Root { .. })
                && base_peak.is_none_or(|b| features[index].intensity > features[b].intensity)
            {
                base_peak = Some(index);
            }
        }
        base_peaks.extend(base_peak);
        progress.advanced(Phase::IsotopeMapping, done + 1, clusters.len());
    }

    let is_base_peak = {
        let mut flags = vec![false; features.len()];
        for &b in &base_peaks {
            flags[b] = true;
        }
        flags
    };

    let sign = ionisation.sign();
    let mapped: Vec<MappedFeature> = features
        .iter()
        .enumerate()
        .map(|(index, f)| {
            let (relationship, isotope_shift, parent, charge): (Relationship, Option<u32>, Option<FeatureId>, i32) =
                match roles[index] {
                    Role::Root { charge } => {
                        let relationship = if is_base_peak[index] {
                            Relationship::BasePeak
                        } else {
                            Relationship::PotentialBasePeak
                        };
                        (relationship, None, None, charge.map_or(0, |z| z as i32 * sign))
                    }
                    Role::Isotope { parent, shift, charge } => {
                        let relationship = if is_base_peak[parent] {
                            Relationship::IsotopeOfBasePeak
                        } else {
                            Relationship::IsotopeOfPotentialBasePeak
                        };
                        (relationship, Some(shift), Some(features[parent].id), charge as i32 * sign)
                    }
                };
            MappedFeature {
                id: f.id,
                cluster_id: f.cluster_id,
                mz: f.mz,
                rt: f.rt,
                intensity: f.intensity,
                relationship,
                isotope_shift,
                parent,
                charge,
            }
        })
        .collect();

    let n_isotopes = mapped.iter().filter(|f| f.relationship.is_isotope()).count();
    log::info!("mapped {n_isotopes} isotope features in {} clusters", clusters.len());
    progress.finished(Phase::IsotopeMapping);
    Ok(mapped)
}
