//! Readers for the input tables of an annotation run.
//!
//! Headers are matched case-insensitively. Files ending in `.tsv`, `.tab` or
//! `.txt` are read tab-separated, everything else comma-separated.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use rayon::prelude::*;

use ipacore::chemistry::sum_formula::SumFormula;
use ipacore::data::compound::{charge_from_adduct_name, AdductRule, Compound, IonisationMode};
use ipacore::data::feature::{Feature, FeatureId};
use ipacore::data::spectrum::{Ms2Spectrum, MzSpectrum, ReferenceSpectrum};
use ipacore::inference::relations::BioNetwork;

use crate::error::{DfError, Result};

pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("tsv") | Some("tab") | Some("txt") => b'\t',
        _ => b',',
    }
}

fn open_table(path: &Path) -> Result<csv::Reader<File>> {
    let file = File::open(path).map_err(|e| DfError::io(path, e))?;
    Ok(reader_from(file, delimiter_for(path)))
}

pub(crate) fn reader_from<R: Read>(source: R, delimiter: u8) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(source)
}

// ---------------------------------------------------------------------------
// Column lookup
// ---------------------------------------------------------------------------

struct Columns {
    table: &'static str,
    names: Vec<String>,
}

impl Columns {
    fn new<R: Read>(table: &'static str, reader: &mut csv::Reader<R>) -> Result<Self> {
        let names = reader.headers()?.iter().map(|h| h.trim().to_ascii_lowercase()).collect();
        Ok(Columns { table, names })
    }

    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| self.names.iter().position(|n| n == alias))
    }

    fn require(&self, aliases: &[&str]) -> Result<usize> {
        self.find(aliases)
            .ok_or_else(|| DfError::data_format(self.table, format!("missing column `{}`", aliases[0])))
    }

    fn error(&self, row: usize, message: impl std::fmt::Display) -> DfError {
        DfError::data_format(self.table, format!("row {}: {message}", row + 1))
    }

    fn f64_at(&self, record: &StringRecord, row: usize, column: Option<usize>) -> Result<Option<f64>> {
        match value(record, column) {
            None => Ok(None),
            Some(text) => text
                .parse::<f64>()
                .map(Some)
                .map_err(|e| self.error(row, format!("`{text}` is not a number: {e}"))),
        }
    }

    fn id_at(&self, record: &StringRecord, row: usize, column: usize) -> Result<u64> {
        let text = value(record, Some(column)).ok_or_else(|| self.error(row, "missing id"))?;
        parse_integer(text).ok_or_else(|| self.error(row, format!("`{text}` is not a non-negative integer id")))
    }
}

/// trimmed cell content, `None` for empty and NA cells
fn value(record: &StringRecord, column: Option<usize>) -> Option<&str> {
    let text = record.get(column?)?.trim();
    match text.to_ascii_lowercase().as_str() {
        "" | "nan" | "na" | "none" => None,
        _ => Some(text),
    }
}

/// integer ids may be written as floats by spreadsheet tools
fn parse_integer(text: &str) -> Option<u64> {
    text.parse::<u64>().ok().or_else(|| {
        let float = text.parse::<f64>().ok()?;
        (float >= 0.0 && float.fract() == 0.0 && float < u64::MAX as f64).then_some(float as u64)
    })
}

fn formula_at(record: &StringRecord, column: Option<usize>) -> Option<&str> {
    value(record, column).filter(|text| !text.eq_ignore_ascii_case("false"))
}

// ---------------------------------------------------------------------------
// MS1 features
// ---------------------------------------------------------------------------

/// Features of an MS1 table and, when present, their relative ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Ms1Table {
    pub features: Vec<Feature>,
    pub relative_ids: Option<Vec<usize>>,
    pub sample_names: Vec<String>,
}

pub fn read_ms1_features(path: impl AsRef<Path>, sample_prefix: Option<&str>) -> Result<Ms1Table> {
    let path = path.as_ref();
    let table = parse_ms1_features(open_table(path)?, sample_prefix)?;
    log::info!(
        "read {} features with {} samples from {}",
        table.features.len(),
        table.sample_names.len(),
        path.display()
    );
    Ok(table)
}

pub(crate) fn parse_ms1_features<R: Read>(mut reader: csv::Reader<R>, sample_prefix: Option<&str>) -> Result<Ms1Table> {
    let columns = Columns::new("MS1 features", &mut reader)?;
    let id = columns.require(&["ids", "id"])?;
    let mz = columns.require(&["mzs", "mz"])?;
    let rt = columns.require(&["rts", "rt"])?;
    let rel = columns.find(&["rel.ids", "rel_ids"]);

    let headers = reader.headers()?.clone();
    let reserved = [Some(id), Some(mz), Some(rt), rel];
    let samples: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| !reserved.contains(&Some(*i)))
        .filter(|(_, name)| match sample_prefix {
            Some(prefix) => name.starts_with(prefix),
            None => !name.trim().is_empty() && !name.to_ascii_lowercase().starts_with("unnamed"),
        })
        .map(|(i, _)| i)
        .collect();
    if samples.is_empty() {
        return Err(DfError::data_format("MS1 features", "no sample intensity columns"));
    }

    let records = reader.records().collect::<std::result::Result<Vec<StringRecord>, csv::Error>>()?;
    let rows = records
        .par_iter()
        .enumerate()
        .map(|(row, record)| {
            let feature_id = columns.id_at(record, row, id)?;
            let feature_mz = columns.f64_at(record, row, Some(mz))?.ok_or_else(|| columns.error(row, "missing m/z"))?;
            let feature_rt = columns.f64_at(record, row, Some(rt))?.ok_or_else(|| columns.error(row, "missing RT"))?;
            let intensities = samples
                .iter()
                .map(|&s| columns.f64_at(record, row, Some(s)).map(|v| v.unwrap_or(f64::NAN)))
                .collect::<Result<Vec<f64>>>()?;
            let relative_id = match rel {
                Some(column) => Some(columns.id_at(record, row, column)? as usize),
                None => None,
            };
            Ok((Feature::new(feature_id, feature_mz, feature_rt, intensities), relative_id))
        })
        .collect::<Result<Vec<(Feature, Option<usize>)>>>()?;

    let (features, relative_ids): (Vec<Feature>, Vec<Option<usize>>) = rows.into_iter().unzip();
    Ok(Ms1Table {
        features,
        relative_ids: relative_ids.into_iter().collect(),
        sample_names: samples.iter().map(|&s| headers[s].to_string()).collect(),
    })
}

// ---------------------------------------------------------------------------
// Adducts and compounds
// ---------------------------------------------------------------------------

pub fn read_adducts(path: impl AsRef<Path>) -> Result<Vec<AdductRule>> {
    parse_adducts(open_table(path.as_ref())?)
}

pub(crate) fn parse_adducts<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<AdductRule>> {
    let columns = Columns::new("adducts", &mut reader)?;
    let name = columns.require(&["name"])?;
    let mass = columns.find(&["mass"]);
    let charge = columns.find(&["charge"]);
    let mult = columns.find(&["mult", "multiplicity"]);
    let ion_mode = columns.require(&["ion_mode", "ionisation", "ion mode"])?;
    let add = columns.find(&["formula_add"]);
    let ded = columns.find(&["formula_ded"]);

    let mut rules = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let adduct = value(&record, Some(name)).ok_or_else(|| columns.error(row, "missing adduct name"))?;
        let ionisation: IonisationMode = value(&record, Some(ion_mode))
            .ok_or_else(|| columns.error(row, "missing ion mode"))?
            .parse()?;
        let signed_charge = match columns.f64_at(&record, row, charge)? {
            Some(z) if z.fract() == 0.0 => z as i32,
            Some(z) => return Err(columns.error(row, format!("charge {z} is not an integer"))),
            None => charge_from_adduct_name(adduct)
                .ok_or_else(|| columns.error(row, format!("no charge given and none in `{adduct}`")))?,
        };
        let multiplicity = match columns.f64_at(&record, row, mult)? {
            Some(n) if n >= 1.0 && n.fract() == 0.0 => n as u32,
            Some(n) => return Err(columns.error(row, format!("multiplicity {n} is not a positive integer"))),
            None => 1,
        };
        let formula_add = formula_at(&record, add).map(SumFormula::new).transpose()?;
        let formula_ded = formula_at(&record, ded).map(SumFormula::new).transpose()?;

        let rule = match columns.f64_at(&record, row, mass)? {
            Some(delta) => AdductRule::new(adduct, delta, signed_charge, multiplicity, ionisation)?
                .with_formulas(formula_add, formula_ded),
            None => AdductRule::from_formulas(adduct, signed_charge, multiplicity, ionisation, formula_add, formula_ded)?,
        };
        rules.push(rule);
    }
    log::debug!("read {} adduct rules", rules.len());
    Ok(rules)
}

pub fn read_compounds(path: impl AsRef<Path>) -> Result<Vec<Compound>> {
    parse_compounds(open_table(path.as_ref())?)
}

pub(crate) fn parse_compounds<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<Compound>> {
    let columns = Columns::new("compound database", &mut reader)?;
    let id = columns.require(&["id", "compound_id"])?;
    let name = columns.find(&["name"]);
    let formula = columns.find(&["formula"]);
    let mass = columns.find(&["mass", "monoisotopic_mass"]);
    let rt_min = columns.find(&["rt_min", "rtmin"]);
    let rt_max = columns.find(&["rt_max", "rtmax"]);
    let adducts = columns.find(&["adducts"]);

    let mut compounds = Vec::new();
    let mut bad_formulas = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let compound_id = value(&record, Some(id)).ok_or_else(|| columns.error(row, "missing compound id"))?;
        let parsed_formula = match formula_at(&record, formula) {
            Some(text) => match SumFormula::new(text) {
                Ok(f) => Some(f),
                Err(e) => {
                    log::warn!("compound {compound_id}: {e}, isotope scoring disabled");
                    bad_formulas += 1;
                    None
                }
            },
            None => None,
        };
        let mut compound = Compound::new(
            compound_id,
            value(&record, name).unwrap_or(compound_id),
            parsed_formula,
            columns.f64_at(&record, row, mass)?,
        );
        match (columns.f64_at(&record, row, rt_min)?, columns.f64_at(&record, row, rt_max)?) {
            (Some(lo), Some(hi)) => compound = compound.with_rt_range(lo, hi),
            (None, None) => {}
            _ => return Err(columns.error(row, "rt_min and rt_max must be given together")),
        }
        if let Some(list) = value(&record, adducts) {
            let allowed = list.split(';').map(str::trim).filter(|a| !a.is_empty()).map(String::from).collect();
            compound = compound.with_adducts(allowed);
        }
        compounds.push(compound);
    }
    if bad_formulas > 0 {
        log::warn!("{bad_formulas} compound formulas could not be parsed");
    }
    log::debug!("read {} compounds", compounds.len());
    Ok(compounds)
}

// ---------------------------------------------------------------------------
// MS2 spectra and library
// ---------------------------------------------------------------------------

pub fn read_ms2_spectra(path: impl AsRef<Path>) -> Result<Vec<Ms2Spectrum>> {
    parse_ms2_spectra(open_table(path.as_ref())?)
}

pub(crate) fn parse_ms2_spectra<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<Ms2Spectrum>> {
    let columns = Columns::new("MS2 spectra", &mut reader)?;
    let id = columns.require(&["id", "ids"])?;
    let spectrum = columns.require(&["spectrum"])?;
    let energy = columns.find(&["ev", "energy"]);

    let mut spectra = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let feature_id: FeatureId = columns.id_at(&record, row, id)?;
        let peaks: MzSpectrum = value(&record, Some(spectrum)).unwrap_or("").parse()?;
        spectra.push(Ms2Spectrum { feature_id, energy: columns.f64_at(&record, row, energy)?, spectrum: peaks });
    }
    Ok(spectra)
}

pub fn read_ms2_library(path: impl AsRef<Path>) -> Result<Vec<ReferenceSpectrum>> {
    parse_ms2_library(open_table(path.as_ref())?)
}

pub(crate) fn parse_ms2_library<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<ReferenceSpectrum>> {
    let columns = Columns::new("MS2 database", &mut reader)?;
    let id = columns.require(&["compound_id", "id"])?;
    let spectrum = columns.require(&["spectrum"])?;
    let adduct = columns.find(&["adduct"]);
    let energy = columns.find(&["ev", "energy"]);

    let mut library = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let compound_id = value(&record, Some(id)).ok_or_else(|| columns.error(row, "missing compound id"))?;
        library.push(ReferenceSpectrum {
            compound_id: compound_id.to_string(),
            adduct: value(&record, adduct).map(String::from),
            energy: columns.f64_at(&record, row, energy)?,
            spectrum: value(&record, Some(spectrum)).unwrap_or("").parse()?,
        });
    }
    Ok(library)
}

// ---------------------------------------------------------------------------
// Biochemical network
// ---------------------------------------------------------------------------

pub fn read_bio_network(path: impl AsRef<Path>) -> Result<BioNetwork> {
    parse_bio_network(open_table(path.as_ref())?)
}

/// The first two columns hold the linked compound ids.
pub(crate) fn parse_bio_network<R: Read>(mut reader: csv::Reader<R>) -> Result<BioNetwork> {
    if reader.headers()?.len() < 2 {
        return Err(DfError::data_format("biochemical network", "needs two compound id columns"));
    }
    let mut links = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let (Some(a), Some(b)) = (value(&record, Some(0)), value(&record, Some(1))) {
            links.push((a.to_string(), b.to_string()));
        }
    }
    let network = BioNetwork::new(links);
    log::debug!("read {} biochemical links", network.num_links());
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_reader(text: &str) -> csv::Reader<&[u8]> {
        reader_from(text.as_bytes(), b',')
    }

    #[test]
    fn test_ms1_columns_and_samples() {
        let text = "\
,ids,MZs,RTs,rel.ids,s1,s2
0,1,181.0707,5.1,0,100,200
1,2,182.0741,5.1,0,7,NaN
";
        let table = parse_ms1_features(csv_reader(text), None).unwrap();
        assert_eq!(table.sample_names, vec!["s1", "s2"]);
        assert_eq!(table.features[0].intensities, vec![100.0, 200.0]);
        assert!(table.features[1].intensities[1].is_nan());
        assert_eq!(table.relative_ids, Some(vec![0, 0]));

        let prefixed = parse_ms1_features(csv_reader(text), Some("s2")).unwrap();
        assert_eq!(prefixed.sample_names, vec!["s2"]);
    }

    #[test]
    fn test_ms1_bad_number_names_row() {
        let text = "ids,mzs,RTs,s1\n1,abc,5.0,1\n";
        let err = parse_ms1_features(csv_reader(text), None).unwrap_err();
        assert!(err.to_string().contains("row 1"));
        assert!(parse_ms1_features(csv_reader("ids,mzs,s1\n1,100,1\n"), None).is_err());
    }

    #[test]
    fn test_adduct_table() {
        let text = "\
name,Mass,Charge,Mult,Ion_mode,Formula_add,Formula_ded
[M+H]+,1.007276,1,1,positive,H,FALSE
[M+2H]2+,,,1,positive,H2,FALSE
[M-H]-,-1.007276,1,1,negative,FALSE,H
";
        let rules = parse_adducts(csv_reader(text)).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1].charge, 2);
        assert!(rules[1].mass_delta.is_none());
        assert_eq!(rules[2].charge, -1);
        assert!(rules[0].formula_ded.is_none());

        let bad = "name,Mass,Charge,Mult,Ion_mode\n[M]+,1.0,0,1,positive\n";
        assert!(parse_adducts(csv_reader(bad)).is_err());
        let bad_mode = "name,Mass,Charge,Mult,Ion_mode\n[M+H]+,1.0,1,1,neutral\n";
        assert!(parse_adducts(csv_reader(bad_mode)).is_err());
    }

    #[test]
    fn test_compound_table() {
        let text = "\
id,name,formula,mass,rt_min,rt_max,adducts
C1,glucose,C6H12O6,180.063388,4,6,[M+H]+;[M+Na]+
C2,no mass,C2H6O,,,,
C3,weird,C6Xx,100.0,,,
";
        let compounds = parse_compounds(csv_reader(text)).unwrap();
        assert_eq!(compounds.len(), 3);
        assert_eq!(compounds[0].adducts.as_ref().map(Vec::len), Some(2));
        assert!(compounds[0].rt_range.is_some_and(|r| r.contains(5.0)));
        assert_eq!(compounds[1].mass, None);
        assert!(compounds[2].formula.is_none());
    }

    #[test]
    fn test_ms2_tables_and_network() {
        let spectra = parse_ms2_spectra(csv_reader("id,spectrum,ev\n1,85.03:100 127.04:35,20\n")).unwrap();
        assert_eq!(spectra[0].feature_id, 1);
        assert_eq!(spectra[0].energy, Some(20.0));
        assert_eq!(spectra[0].spectrum.len(), 2);

        let library = parse_ms2_library(csv_reader("compound_id,adduct,spectrum\nC1,,85.03:100\n")).unwrap();
        assert_eq!(library[0].adduct, None);

        let network = parse_bio_network(csv_reader("a,b\nC1,C2\nC2,C3\n")).unwrap();
        assert!(network.linked("C2", "C1"));
        assert_eq!(network.num_links(), 2);
    }

    #[test]
    fn test_library_entry_serialises_shared_peaks() {
        let library =
            parse_ms2_library(csv_reader("compound_id,adduct,ev,spectrum\nC1,[M+H]+,20,85.03:100 127.04:35\n")).unwrap();
        let json = serde_json::to_value(&library[0]).unwrap();
        assert_eq!(json["compound_id"], "C1");
        assert_eq!(json["spectrum"]["mz"], serde_json::json!([85.03, 127.04]));

        let back: ReferenceSpectrum = serde_json::from_value(json).unwrap();
        assert_eq!(back, library[0]);
    }
}
