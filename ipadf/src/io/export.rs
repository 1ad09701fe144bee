use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};

use ipacore::data::annotation::{AnnotationRow, AnnotationTable};
use ipacore::data::feature::{FeatureId, MappedFeature};

use crate::error::{DfError, Result};
use crate::io::tables::{delimiter_for, reader_from};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Tsv,
}

impl ExportFormat {
    pub fn delimiter(&self) -> u8 {
        match self {
            ExportFormat::Csv => b',',
            ExportFormat::Tsv => b'\t',
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
        }
    }
}

impl Display for ExportFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = DfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "tsv" | "tab" => Ok(ExportFormat::Tsv),
            other => Err(DfError::data_format("export", format!("unsupported export format `{other}`"))),
        }
    }
}

/// One line of the summary or most-likely table.
///
/// Annotation columns are empty for features without a table (isotopes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    #[serde(rename = "ids")]
    pub feature_id: FeatureId,
    #[serde(rename = "rel.ids")]
    pub cluster_id: usize,
    #[serde(rename = "mzs")]
    pub mz: f64,
    #[serde(rename = "RTs")]
    pub rt: f64,
    #[serde(rename = "Int")]
    pub intensity: f64,
    pub relationship: String,
    #[serde(rename = "isotope pattern")]
    pub isotope_pattern: String,
    pub charge: i32,
    #[serde(rename = "compound id")]
    pub compound_id: Option<String>,
    pub name: Option<String>,
    pub formula: Option<String>,
    pub adduct: Option<String>,
    #[serde(rename = "m/z")]
    pub theoretical_mz: Option<f64>,
    pub ppm: Option<f64>,
    pub post: Option<f64>,
    #[serde(rename = "post Gibbs", default)]
    pub post_gibbs: Option<f64>,
}

const UNKNOWN: &str = "unknown";

const BASE_COLUMNS: [&str; 16] = [
    "ids",
    "rel.ids",
    "mzs",
    "RTs",
    "Int",
    "relationship",
    "isotope pattern",
    "charge",
    "compound id",
    "name",
    "formula",
    "adduct",
    "m/z",
    "ppm",
    "post",
    "post Gibbs",
];

impl SummaryRow {
    fn feature_only(feature: &MappedFeature) -> Self {
        SummaryRow {
            feature_id: feature.id,
            cluster_id: feature.cluster_id,
            mz: feature.mz,
            rt: feature.rt,
            intensity: feature.intensity,
            relationship: feature.relationship.to_string(),
            isotope_pattern: feature.isotope_pattern_label(),
            charge: feature.charge,
            compound_id: None,
            name: None,
            formula: None,
            adduct: None,
            theoretical_mz: None,
            ppm: None,
            post: None,
            post_gibbs: None,
        }
    }

    fn annotated(feature: &MappedFeature, row: &AnnotationRow) -> Self {
        let base = Self::feature_only(feature);
        match &row.hypothesis {
            Some(h) => SummaryRow {
                compound_id: Some(h.compound_id.clone()),
                name: Some(h.name.clone()),
                formula: h.formula.as_ref().map(ToString::to_string),
                adduct: Some(h.adduct.clone()),
                theoretical_mz: Some(h.mz),
                ppm: row.ppm,
                post: Some(row.post),
                post_gibbs: row.post_gibbs,
                ..base
            },
            None => SummaryRow {
                compound_id: Some(UNKNOWN.to_string()),
                name: Some(UNKNOWN.to_string()),
                post: Some(row.post),
                post_gibbs: row.post_gibbs,
                ..base
            },
        }
    }

    fn record(&self, with_gibbs: bool) -> Vec<String> {
        fn cell<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        let mut record = vec![
            self.feature_id.to_string(),
            self.cluster_id.to_string(),
            self.mz.to_string(),
            self.rt.to_string(),
            self.intensity.to_string(),
            self.relationship.clone(),
            self.isotope_pattern.clone(),
            self.charge.to_string(),
            cell(&self.compound_id),
            cell(&self.name),
            cell(&self.formula),
            cell(&self.adduct),
            cell(&self.theoretical_mz),
            cell(&self.ppm),
            cell(&self.post),
        ];
        if with_gibbs {
            record.push(cell(&self.post_gibbs));
        }
        record
    }
}

/// One row per (feature, hypothesis), features in input order; features
/// without an annotation table appear once with empty annotation columns.
pub fn summary_rows(features: &[MappedFeature], tables: &[AnnotationTable]) -> Vec<SummaryRow> {
    let by_feature: HashMap<FeatureId, &AnnotationTable> = tables.iter().map(|t| (t.feature_id, t)).collect();
    features
        .iter()
        .flat_map(|feature| match by_feature.get(&feature.id) {
            Some(table) => table.rows.iter().map(|row| SummaryRow::annotated(feature, row)).collect(),
            None => vec![SummaryRow::feature_only(feature)],
        })
        .collect()
}

/// One row per feature in input order: the most probable row of its table,
/// by `post Gibbs` when sampled and `post` otherwise. Features without a
/// table (isotopes) keep empty annotation columns.
pub fn most_likely_rows(features: &[MappedFeature], tables: &[AnnotationTable]) -> Vec<SummaryRow> {
    let by_feature: HashMap<FeatureId, &AnnotationTable> = tables.iter().map(|t| (t.feature_id, t)).collect();
    features
        .iter()
        .map(|feature| match by_feature.get(&feature.id).and_then(|table| table.most_likely()) {
            Some(row) => SummaryRow::annotated(feature, row),
            None => SummaryRow::feature_only(feature),
        })
        .collect()
}

/// Write rows as a delimited table. The `post Gibbs` column is only written
/// when some row carries it.
pub fn write_rows<W: Write>(writer: W, rows: &[SummaryRow], format: ExportFormat) -> Result<()> {
    let with_gibbs = rows.iter().any(|r| r.post_gibbs.is_some());
    let mut writer = WriterBuilder::new().delimiter(format.delimiter()).from_writer(writer);
    let header = if with_gibbs { &BASE_COLUMNS[..] } else { &BASE_COLUMNS[..BASE_COLUMNS.len() - 1] };
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.record(with_gibbs))?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn write_table(path: impl AsRef<Path>, rows: &[SummaryRow], format: ExportFormat) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| DfError::io(path, e))?;
    write_rows(BufWriter::new(file), rows, format)?;
    log::info!("wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn read_rows<R: Read>(reader: R, format: ExportFormat) -> Result<Vec<SummaryRow>> {
    let mut reader = reader_from(reader, format.delimiter());
    let rows = reader.deserialize().collect::<std::result::Result<Vec<SummaryRow>, csv::Error>>()?;
    Ok(rows)
}

/// Read a summary or most-likely table written by [`write_table`].
pub fn read_table(path: impl AsRef<Path>) -> Result<Vec<SummaryRow>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| DfError::io(path, e))?;
    let format = if delimiter_for(path) == b'\t' { ExportFormat::Tsv } else { ExportFormat::Csv };
    read_rows(file, format)
}
