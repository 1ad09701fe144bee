use std::error::Error;
use std::fs;
use std::path::Path;

use ipacore::data::compound::IonisationMode;
use ipacore::data::feature::Relationship;
use ipacore::inference::gibbs::SamplerMode;
use ipacore::progress::{NoProgress, Phase, ProgressEvent};
use ipadf::io::export::{read_table, ExportFormat};
use ipadf::pipeline::{run_pipeline, PipelineConfig, PipelinePaths};

type TestResult = Result<(), Box<dyn Error>>;

// glucose [M+H]+, its M+1 isotope at natural abundance, glucose [M+Na]+,
// and an unrelated feature
const MS1: &str = "\
ids,mzs,RTs,s1,s2,s3,s4
1,181.070664,5.0,100,200,300,400
2,182.074019,5.0,6.65,13.3,19.95,26.6
3,203.052606,5.05,50,100,150,200
4,300.0,9.0,5,1,7,2
";

const ADDUCTS: &str = "\
name,Mass,Charge,Mult,Ion_mode,Formula_add,Formula_ded
[M+H]+,1.007276,1,1,positive,H,FALSE
[M+Na]+,22.989218,1,1,positive,Na,FALSE
[M-H]-,-1.007276,1,1,negative,FALSE,H
";

const COMPOUNDS: &str = "\
id,name,formula,mass
C1,glucose,C6H12O6,180.063388
C2,sucrose,C12H22O11,
";

const MS2: &str = "\
id,spectrum,ev
1,85.0284:100 127.0390:35,20
";

const MS2_DB: &str = "\
compound_id,adduct,ev,spectrum
C1,[M+H]+,20,85.0284:100 127.0390:35
";

fn write_inputs(dir: &Path) -> Result<PipelinePaths, Box<dyn Error>> {
    let paths = PipelinePaths {
        ms1: dir.join("ms1.csv"),
        adducts: dir.join("adducts.csv"),
        compounds: dir.join("db.csv"),
        ms2: None,
        ms2_library: None,
        network: None,
        output_dir: dir.join("out"),
    };
    fs::write(&paths.ms1, MS1)?;
    fs::write(&paths.adducts, ADDUCTS)?;
    fs::write(&paths.compounds, COMPOUNDS)?;
    Ok(paths)
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig {
        ionisation: Some(IonisationMode::Positive),
        most_likely_filename: Some("most_likely.csv".to_string()),
        ..Default::default()
    };
    config.isotopes.min_isotope_ratio = 0.05;
    config
}

#[test_log::test]
fn test_ms1_pipeline_end_to_end() -> TestResult {
    let tmpdir = tempfile::tempdir()?;
    let paths = write_inputs(tmpdir.path())?;
    let output = run_pipeline(&paths, &config(), &NoProgress)?;

    let relationships: Vec<Relationship> = output.annotation.features.iter().map(|f| f.relationship).collect();
    assert_eq!(
        relationships,
        vec![
            Relationship::BasePeak,
            Relationship::IsotopeOfBasePeak,
            Relationship::PotentialBasePeak,
            Relationship::BasePeak,
        ]
    );
    assert_eq!(output.annotation.enumeration.missing_mass, 1);
    assert_eq!(output.annotation.tables.len(), 3);
    for table in &output.annotation.tables {
        table.check_normalised(1e-6)?;
    }

    let summary = read_table(&output.summary_path)?;
    assert_eq!(summary.len(), 6);
    assert_eq!(summary[0].compound_id.as_deref(), Some("C1"));
    assert_eq!(summary[0].adduct.as_deref(), Some("[M+H]+"));
    assert_eq!(summary[2].isotope_pattern, "M+1");
    assert!(summary.iter().all(|r| r.post_gibbs.is_none()));

    let most_likely = read_table(output.most_likely_path.as_ref().ok_or("no most likely table")?)?;
    let best: Vec<Option<&str>> = most_likely.iter().map(|r| r.compound_id.as_deref()).collect();
    assert_eq!(best, vec![Some("C1"), None, Some("C1"), Some("unknown")]);
    assert_eq!(most_likely[1].relationship, "bp|isotope");
    Ok(())
}

#[test_log::test]
fn test_gibbs_and_tsv_export() -> TestResult {
    let tmpdir = tempfile::tempdir()?;
    let paths = write_inputs(tmpdir.path())?;
    let mut config = config();
    config.run_gibbs = true;
    config.gibbs.iterations = 400;
    config.gibbs.all_out = true;
    config.export_format = ExportFormat::Tsv;
    config.summary_filename = "summary.tsv".to_string();
    config.most_likely_filename = None;

    let output = run_pipeline(&paths, &config, &NoProgress)?;
    assert_eq!(output.annotation.trace.as_ref().map(Vec::len), Some(400));
    for table in &output.annotation.tables {
        assert!(table.has_post_gibbs());
        table.check_normalised(1e-9)?;
    }

    let text = fs::read_to_string(&output.summary_path)?;
    assert!(text.lines().next().is_some_and(|header| header.ends_with("post\tpost Gibbs")));
    let summary = read_table(&output.summary_path)?;
    assert_eq!(summary.len(), 6);
    assert!(summary[0].post_gibbs.is_some());
    assert!(summary[2].post_gibbs.is_none());
    Ok(())
}

#[test_log::test]
fn test_msms_annotation_and_progress() -> TestResult {
    let tmpdir = tempfile::tempdir()?;
    let mut paths = write_inputs(tmpdir.path())?;
    let ms2 = tmpdir.path().join("ms2.csv");
    let ms2_db = tmpdir.path().join("ms2_db.csv");
    fs::write(&ms2, MS2)?;
    fs::write(&ms2_db, MS2_DB)?;
    paths.ms2 = Some(ms2);
    paths.ms2_library = Some(ms2_db);

    let phases = std::sync::Mutex::new(Vec::new());
    let sink = |event: ProgressEvent| {
        if let ProgressEvent::Finished { phase } = event {
            if let Ok(mut phases) = phases.lock() {
                phases.push(phase);
            }
        }
    };
    let output = run_pipeline(&paths, &config(), &sink)?;

    let first = &output.annotation.tables[0];
    assert_eq!(first.rows[0].compound_id(), Some("C1"));
    assert!((first.rows[0].ms2_score.ok_or("no ms2 score")? - 1.0).abs() < 1e-9);
    // groups without fragment spectra are scored on MS1 alone
    assert!(output.annotation.tables[1].rows.iter().all(|r| r.ms2_score.is_none()));

    let phases = phases.into_inner().map_err(|e| e.to_string())?;
    assert_eq!(
        phases,
        vec![Phase::Clustering, Phase::IsotopeMapping, Phase::AdductEnumeration, Phase::Scoring]
    );
    Ok(())
}

#[test_log::test]
fn test_incomplete_ms2_inputs_fall_back_to_ms1() -> TestResult {
    let tmpdir = tempfile::tempdir()?;
    let mut paths = write_inputs(tmpdir.path())?;
    let ms2 = tmpdir.path().join("ms2.csv");
    fs::write(&ms2, MS2)?;
    paths.ms2 = Some(ms2);

    let output = run_pipeline(&paths, &config(), &NoProgress)?;
    assert!(output.annotation.tables.iter().flat_map(|t| &t.rows).all(|r| r.ms2_score.is_none()));
    Ok(())
}

#[test_log::test]
fn test_invalid_configuration_fails_before_reading() -> TestResult {
    let paths = PipelinePaths { output_dir: "does-not-matter".into(), ..Default::default() };

    let mut config = config();
    config.run_gibbs = true;
    config.gibbs_mode = SamplerMode::Biochemical;
    let err = run_pipeline(&paths, &config, &NoProgress).unwrap_err();
    assert!(err.to_string().contains("network"));

    let config = PipelineConfig { ionisation: None, ..Default::default() };
    let err = run_pipeline(&paths, &config, &NoProgress).unwrap_err();
    assert!(err.to_string().contains("ionisation"));
    Ok(())
}

#[test_log::test]
fn test_skipped_clustering_uses_singletons() -> TestResult {
    let tmpdir = tempfile::tempdir()?;
    let paths = write_inputs(tmpdir.path())?;
    let mut config = config();
    config.run_clustering = false;

    let output = run_pipeline(&paths, &config, &NoProgress)?;
    // no shared cluster, so no isotope is detected
    assert!(output.annotation.features.iter().all(|f| !f.relationship.is_isotope()));
    assert_eq!(output.annotation.tables.len(), 4);
    Ok(())
}
