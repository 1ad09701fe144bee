//! End-to-end annotation run: read tables, cluster, map isotopes, enumerate
//! adducts, score, optionally sample, and export.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ipacore::data::annotation::AnnotationTable;
use ipacore::data::compound::{AdductRule, Compound, IonisationMode};
use ipacore::data::feature::{feature_groups, Feature, MappedFeature};
use ipacore::data::spectrum::{Ms2Spectrum, ReferenceSpectrum};
use ipacore::error::IpaError;
use ipacore::inference::adducts::{enumerate_adducts, EnumerationParams, EnumerationReport};
use ipacore::inference::clustering::{cluster_features, from_relative_ids, singletons, ClusteringParams};
use ipacore::inference::gibbs::{run_gibbs, GibbsParams, SamplerMode};
use ipacore::inference::isotope_mapping::{map_isotope_patterns, IsotopeParams};
use ipacore::inference::relations::BioNetwork;
use ipacore::inference::scoring::{score_ms1, score_msms, Ms2Evidence, ScoringParams};
use ipacore::progress::ProgressSink;

use crate::error::{DfError, Result};
use crate::io::export::{most_likely_rows, summary_rows, write_table, ExportFormat};
use crate::io::tables::{
    read_adducts, read_bio_network, read_compounds, read_ms1_features, read_ms2_library, read_ms2_spectra,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ionisation: Option<IonisationMode>,
    pub run_clustering: bool,
    pub run_gibbs: bool,
    pub gibbs_mode: SamplerMode,
    /// applied to every phase when set
    pub num_threads: Option<usize>,
    /// prefix of the sample intensity columns, all other columns when unset
    pub sample_prefix: Option<String>,
    pub export_format: ExportFormat,
    pub summary_filename: String,
    pub most_likely_filename: Option<String>,
    pub clustering: ClusteringParams,
    pub isotopes: IsotopeParams,
    pub enumeration: EnumerationParams,
    pub scoring: ScoringParams,
    pub gibbs: GibbsParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ionisation: None,
            run_clustering: true,
            run_gibbs: false,
            gibbs_mode: SamplerMode::Adduct,
            num_threads: None,
            sample_prefix: None,
            export_format: ExportFormat::Csv,
            summary_filename: "summary.csv".to_string(),
            most_likely_filename: None,
            clustering: ClusteringParams::default(),
            isotopes: IsotopeParams::default(),
            enumeration: EnumerationParams::default(),
            scoring: ScoringParams::default(),
            gibbs: GibbsParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DfError::io(path, e))?;
        Self::from_json_str(&text)
    }

    /// Copy with `num_threads` pushed down into every phase.
    pub fn resolved(&self) -> PipelineConfig {
        let mut config = self.clone();
        if let Some(n) = self.num_threads {
            config.clustering.num_threads = n;
            config.enumeration.num_threads = n;
            config.scoring.num_threads = n;
            config.gibbs.num_threads = n;
        }
        config
    }

    /// Reject unusable settings before any table is read.
    pub fn validate(&self) -> Result<IonisationMode> {
        let ionisation = self
            .ionisation
            .ok_or_else(|| IpaError::validation("ionisation is required (positive or negative)"))?;
        self.clustering.validate()?;
        self.isotopes.validate()?;
        self.scoring.validate()?;
        if self.run_gibbs {
            self.gibbs.validate()?;
        }
        if self.summary_filename.trim().is_empty() {
            return Err(IpaError::validation("summary_filename must not be empty").into());
        }
        Ok(ionisation)
    }
}

/// Locations of the input tables and the output directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelinePaths {
    pub ms1: PathBuf,
    pub adducts: PathBuf,
    pub compounds: PathBuf,
    pub ms2: Option<PathBuf>,
    pub ms2_library: Option<PathBuf>,
    pub network: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Everything an annotation run consumes, already loaded.
#[derive(Clone, Debug, Default)]
pub struct AnnotationInputs {
    pub features: Vec<Feature>,
    pub relative_ids: Option<Vec<usize>>,
    pub rules: Vec<AdductRule>,
    pub compounds: Vec<Compound>,
    pub ms2: Option<(Vec<Ms2Spectrum>, Vec<ReferenceSpectrum>)>,
    pub network: Option<BioNetwork>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub features: Vec<MappedFeature>,
    pub tables: Vec<AnnotationTable>,
    pub enumeration: EnumerationReport,
    /// per-iteration assignments of the sampler, with `gibbs.all_out`
    pub trace: Option<Vec<Vec<usize>>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutput {
    pub annotation: Annotation,
    pub summary_path: PathBuf,
    pub most_likely_path: Option<PathBuf>,
}

/// Run every phase on in-memory inputs.
pub fn annotate(inputs: &AnnotationInputs, config: &PipelineConfig, progress: &dyn ProgressSink) -> Result<Annotation> {
    let config = config.resolved();
    let ionisation = config.validate()?;
    if config.run_gibbs && config.gibbs_mode.needs_network() && inputs.network.is_none() {
        return Err(IpaError::validation(format!("{} gibbs sampler needs a biochemical network", config.gibbs_mode)).into());
    }

    let clustered = match (&inputs.relative_ids, config.run_clustering) {
        (_, true) => cluster_features(&inputs.features, &config.clustering, progress)?,
        (Some(relative_ids), false) => {
            log::info!("clustering skipped, using relative ids from the input");
            from_relative_ids(&inputs.features, relative_ids, config.clustering.intensity_mode)?
        }
        (None, false) => {
            log::info!("clustering skipped");
            singletons(&inputs.features, config.clustering.intensity_mode)
        }
    };

    let features = map_isotope_patterns(&clustered, ionisation, &config.isotopes, progress)?;
    let groups = feature_groups(&features);

    let (hypotheses, enumeration) =
        enumerate_adducts(&inputs.rules, &inputs.compounds, ionisation, &config.enumeration, progress)?;

    let tables = match &inputs.ms2 {
        Some((spectra, library)) => {
            log::info!("annotating {} feature groups with MS2 evidence", groups.len());
            let evidence = Ms2Evidence::new(spectra, library);
            score_msms(&groups, &hypotheses, &evidence, &config.scoring, progress)?
        }
        None => {
            log::info!("annotating {} feature groups on MS1 evidence only", groups.len());
            score_ms1(&groups, &hypotheses, &config.scoring, progress)?
        }
    };

    let (tables, trace) = if config.run_gibbs {
        let output = run_gibbs(&tables, config.gibbs_mode, inputs.network.as_ref(), &config.gibbs, progress)?;
        (output.tables, output.trace)
    } else {
        (tables, None)
    };

    Ok(Annotation { features, tables, enumeration, trace })
}

/// Read the tables named in `paths`, annotate, and export the summary (and
/// most-likely) table into `paths.output_dir`.
pub fn run_pipeline(paths: &PipelinePaths, config: &PipelineConfig, progress: &dyn ProgressSink) -> Result<PipelineOutput> {
    config.resolved().validate()?;
    if config.run_gibbs && config.gibbs_mode.needs_network() && paths.network.is_none() {
        return Err(IpaError::validation(format!("{} gibbs sampler needs a biochemical network", config.gibbs_mode)).into());
    }

    let ms1 = read_ms1_features(&paths.ms1, config.sample_prefix.as_deref())?;
    let rules = read_adducts(&paths.adducts)?;
    let compounds = read_compounds(&paths.compounds)?;

    let ms2 = match (&paths.ms2, &paths.ms2_library) {
        (Some(spectra), Some(library)) => Some((read_ms2_spectra(spectra)?, read_ms2_library(library)?)),
        (None, None) => None,
        _ => {
            log::warn!("MS2 inputs incomplete, running MS1-only");
            None
        }
    };
    let network = match (&paths.network, config.run_gibbs && config.gibbs_mode.needs_network()) {
        (Some(path), true) => Some(read_bio_network(path)?),
        _ => None,
    };

    let inputs = AnnotationInputs {
        features: ms1.features,
        relative_ids: ms1.relative_ids,
        rules,
        compounds,
        ms2,
        network,
    };
    let annotation = annotate(&inputs, config, progress)?;

    fs::create_dir_all(&paths.output_dir).map_err(|e| DfError::io(&paths.output_dir, e))?;
    let summary_path = paths.output_dir.join(&config.summary_filename);
    write_table(&summary_path, &summary_rows(&annotation.features, &annotation.tables), config.export_format)?;

    let most_likely_path = match &config.most_likely_filename {
        Some(name) => {
            let path = paths.output_dir.join(name);
            write_table(&path, &most_likely_rows(&annotation.features, &annotation.tables), config.export_format)?;
            Some(path)
        }
        None => None,
    };

    Ok(PipelineOutput { annotation, summary_path, most_likely_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config = PipelineConfig::from_json_str(
            r#"{"ionisation": "positive", "run_gibbs": true, "gibbs_mode": "biochemical and adduct",
                "scoring": {"ppm": 5.0}, "gibbs": {"iterations": 500}}"#,
        )
        .unwrap();
        assert_eq!(config.ionisation, Some(IonisationMode::Positive));
        assert_eq!(config.gibbs_mode, SamplerMode::BiochemicalAndAdduct);
        assert_eq!(config.scoring.ppm, 5.0);
        assert_eq!(config.scoring.ppm_threshold(), 10.0);
        assert_eq!(config.gibbs.burn(), 50);
        assert_eq!(config.clustering.correlation_threshold, 0.8);
        assert_eq!(config.summary_filename, "summary.csv");
    }

    #[test]
    fn test_config_accepts_signed_ionisation_and_short_names() {
        use ipacore::data::feature::IntensityMode;

        let config =
            PipelineConfig::from_json_str(r#"{"ionisation": -1, "clustering": {"intensity_mode": "ave"}}"#).unwrap();
        assert_eq!(config.ionisation, Some(IonisationMode::Negative));
        assert_eq!(config.clustering.intensity_mode, IntensityMode::Average);

        let config = PipelineConfig::from_json_str(r#"{"ionisation": 1}"#).unwrap();
        assert_eq!(config.ionisation, Some(IonisationMode::Positive));
        let config = PipelineConfig::from_json_str(r#"{"ionisation": "neg"}"#).unwrap();
        assert_eq!(config.ionisation, Some(IonisationMode::Negative));

        assert!(PipelineConfig::from_json_str(r#"{"ionisation": 0}"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{"ionisation": "neutral"}"#).is_err());
    }

    #[test]
    fn test_missing_ionisation_is_rejected() {
        let err = PipelineConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("ionisation"));
    }

    #[test]
    fn test_num_threads_reaches_every_phase() {
        let config = PipelineConfig { num_threads: Some(3), ..Default::default() }.resolved();
        assert_eq!(config.scoring.num_threads, 3);
        assert_eq!(config.gibbs.num_threads, 3);
    }

    #[test]
    fn test_burn_validated_only_when_sampling() {
        let mut config = PipelineConfig { ionisation: Some(IonisationMode::Negative), ..Default::default() };
        config.gibbs.burn = Some(5000);
        assert!(config.validate().is_ok());
        config.run_gibbs = true;
        assert!(config.validate().is_err());
    }
}
