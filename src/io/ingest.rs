//! CSV and TOML ingest.
//!
//! Turns a haul table, a prediction grid and a run configuration into the
//! domain types the index pipeline consumes.
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Open covariates**: any further numeric column becomes an extra
//!   covariate formulas may refer to by its (lower-cased) header name

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;

use crate::domain::{GridCell, HaulRecord, RunConfig};
use crate::error::{Result, SurveyIndexError};

/// Level used when a haul has no gear or ship column.
pub const UNKNOWN_LEVEL: &str = "NA";

const HAUL_COLUMNS: [&str; 9] = [
    "haul_id",
    "year",
    "lon",
    "lat",
    "depth",
    "gear",
    "ship",
    "time_of_year",
    "haul_dur",
];

const GRID_COLUMNS: [&str; 3] = ["lon", "lat", "depth"];

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub id: Option<String>,
    pub message: String,
}

/// Parsed rows plus what was skipped.
#[derive(Debug, Clone)]
pub struct Ingested<T> {
    pub rows: Vec<T>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

/// Load hauls from a CSV file. `ages` are the configured age-class labels;
/// the count of age `a` is read from column `age_<a>`, `n_age_<a>` or `<a>`.
pub fn load_hauls(path: &Path, ages: &[String]) -> Result<Ingested<HaulRecord>> {
    read_hauls(open(path)?, ages)
}

pub fn load_grid(path: &Path) -> Result<Ingested<GridCell>> {
    read_grid(open(path)?)
}

pub fn load_run_config(path: &Path) -> Result<RunConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SurveyIndexError::Io(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    parse_run_config(&text)
        .map_err(|e| SurveyIndexError::Parse(format!("Invalid config '{}': {e}", path.display())))
}

pub fn parse_run_config(text: &str) -> std::result::Result<RunConfig, toml::de::Error> {
    toml::from_str(text)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        SurveyIndexError::Io(format!("Failed to open CSV '{}': {e}", path.display()))
    })
}

pub fn read_hauls<R: Read>(reader: R, ages: &[String]) -> Result<Ingested<HaulRecord>> {
    let mut reader = csv_reader(reader);
    let header_map = read_header_map(&mut reader)?;
    ensure_columns(&header_map, &["year", "lon", "lat", "depth"], "haul")?;

    let age_columns = ages
        .iter()
        .map(|age| {
            resolve_age_column(age, &header_map).ok_or_else(|| {
                SurveyIndexError::Parse(format!(
                    "Missing count column for age `{age}` (expected `age_{age}`, `n_age_{age}` or `{age}`)"
                ))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let extras = extra_columns(&header_map, &HAUL_COLUMNS, &age_columns);

    let id_column = header_map.get("haul_id").copied();
    read_rows(reader, id_column, |record, line| {
        parse_haul(record, &header_map, &age_columns, &extras, line)
    })
}

pub fn read_grid<R: Read>(reader: R) -> Result<Ingested<GridCell>> {
    let mut reader = csv_reader(reader);
    let header_map = read_header_map(&mut reader)?;
    ensure_columns(&header_map, &GRID_COLUMNS, "grid")?;
    let extras = extra_columns(&header_map, &GRID_COLUMNS, &[]);

    read_rows(reader, None, |record, _| {
        Ok(GridCell {
            lon: get_f64(record, &header_map, "lon")?,
            lat: get_f64(record, &header_map, "lat")?,
            depth: get_f64(record, &header_map, "depth")?,
            extra: parse_extras(record, &extras),
        })
    })
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader)
}

fn read_header_map<R: Read>(reader: &mut csv::Reader<R>) -> Result<HashMap<String, usize>> {
    let headers = reader
        .headers()
        .map_err(|e| SurveyIndexError::Parse(format!("Failed to read CSV headers: {e}")))?
        .clone();
    Ok(build_header_map(&headers))
}

fn read_rows<R: Read, T>(
    mut reader: csv::Reader<R>,
    id_column: Option<usize>,
    mut parse: impl FnMut(&StringRecord, usize) -> std::result::Result<T, String>,
) -> Result<Ingested<T>> {
    let mut rows = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header line; lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    id: None,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        match parse(&record, line) {
            Ok(row) => rows.push(row),
            Err(message) => {
                log::warn!("line {line}: skipped ({message})");
                row_errors.push(RowError {
                    line,
                    id: id_column
                        .and_then(|i| record.get(i))
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                    message,
                });
            }
        }
    }

    if rows.is_empty() {
        return Err(SurveyIndexError::Parse(format!(
            "No valid rows among {rows_read} CSV records."
        )));
    }

    Ok(Ingested {
        rows,
        row_errors,
        rows_read,
    })
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn ensure_columns(header_map: &HashMap<String, usize>, required: &[&str], table: &str) -> Result<()> {
    for name in required {
        if !header_map.contains_key(*name) {
            return Err(SurveyIndexError::Parse(format!(
                "Missing required {table} column: `{name}`"
            )));
        }
    }
    Ok(())
}

fn resolve_age_column(age: &str, header_map: &HashMap<String, usize>) -> Option<usize> {
    let age = age.to_ascii_lowercase();
    [format!("age_{age}"), format!("n_age_{age}"), age]
        .iter()
        .find_map(|name| header_map.get(name).copied())
}

/// Columns other than the known schema and the age counts, by name.
fn extra_columns(
    header_map: &HashMap<String, usize>,
    known: &[&str],
    age_columns: &[usize],
) -> BTreeMap<String, usize> {
    header_map
        .iter()
        .filter(|(name, idx)| !known.contains(&name.as_str()) && !age_columns.contains(*idx))
        .map(|(name, &idx)| (name.clone(), idx))
        .collect()
}

/// Numeric extras of one row; empty or non-numeric cells are left out.
fn parse_extras(record: &StringRecord, extras: &BTreeMap<String, usize>) -> BTreeMap<String, f64> {
    extras
        .iter()
        .filter_map(|(name, &idx)| {
            let value = record.get(idx)?.parse::<f64>().ok()?;
            value.is_finite().then(|| (name.clone(), value))
        })
        .collect()
}

fn parse_haul(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    age_columns: &[usize],
    extras: &BTreeMap<String, usize>,
    line: usize,
) -> std::result::Result<HaulRecord, String> {
    let haul_id = get_optional(record, header_map, "haul_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("line{line}"));

    let year_text = get_required(record, header_map, "year")?;
    let year = year_text
        .parse::<i32>()
        .map_err(|_| format!("Invalid year `{year_text}`"))?;

    let numbers_at_age = age_columns
        .iter()
        .map(|&idx| {
            let text = record.get(idx).unwrap_or("").trim();
            match text.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
                _ => Err(format!("Invalid age count `{text}`")),
            }
        })
        .collect::<std::result::Result<Vec<f64>, String>>()?;

    Ok(HaulRecord {
        haul_id,
        year,
        lon: get_f64(record, header_map, "lon")?,
        lat: get_f64(record, header_map, "lat")?,
        depth: get_f64(record, header_map, "depth")?,
        gear: get_level(record, header_map, "gear"),
        ship: get_level(record, header_map, "ship"),
        time_of_year: parse_opt_f64(get_optional(record, header_map, "time_of_year")),
        haul_dur: parse_opt_f64(get_optional(record, header_map, "haul_dur")),
        extra: parse_extras(record, extras),
        numbers_at_age,
    })
}

fn get_required<'a>(
    record: &'a StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> std::result::Result<&'a str, String> {
    get_optional(record, header_map, name).ok_or_else(|| format!("Missing value for `{name}`"))
}

fn get_optional<'a>(record: &'a StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Option<&'a str> {
    let idx = header_map.get(name)?;
    record.get(*idx).filter(|s| !s.is_empty())
}

fn get_f64(
    record: &StringRecord,
    header_map: &HashMap<String, usize>,
    name: &str,
) -> std::result::Result<f64, String> {
    let text = get_required(record, header_map, name)?;
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("Invalid number `{text}` for `{name}`")),
    }
}

fn get_level(record: &StringRecord, header_map: &HashMap<String, usize>, name: &str) -> String {
    get_optional(record, header_map, name)
        .unwrap_or(UNKNOWN_LEVEL)
        .to_string()
}

/// Missing optional numbers become NaN; formulas that use them then fail.
fn parse_opt_f64(s: Option<&str>) -> f64 {
    s.and_then(|s| s.parse::<f64>().ok()).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ages() -> Vec<String> {
        vec!["1".to_string(), "2".to_string()]
    }

    #[test]
    fn reads_hauls_with_extras_and_age_columns() {
        let csv = "\u{feff}Haul_ID,Year,Lon,Lat,Depth,Gear,Ship,Time_of_year,Haul_dur,Temp,age_1,N_age_2\n\
                   H1,2001,10.5,55.0,42,TVL,DAN2,45,30,7.5,12,0\n\
                   H2,2002,11.0,55.5,38,GOV,,50,,,0,3.5\n";
        let data = read_hauls(csv.as_bytes(), &ages()).unwrap();
        assert_eq!(data.rows_read, 2);
        assert!(data.row_errors.is_empty());

        let h1 = &data.rows[0];
        assert_eq!(h1.haul_id, "H1");
        assert_eq!(h1.year, 2001);
        assert_eq!(h1.numbers_at_age, vec![12.0, 0.0]);
        assert_eq!(h1.extra.get("temp"), Some(&7.5));

        let h2 = &data.rows[1];
        assert_eq!(h2.ship, UNKNOWN_LEVEL);
        assert!(h2.haul_dur.is_nan());
        assert!(h2.extra.is_empty());
        assert_eq!(h2.numbers_at_age, vec![0.0, 3.5]);
    }

    #[test]
    fn bad_rows_are_skipped_and_reported() {
        let csv = "haul_id,year,lon,lat,depth,1,2\n\
                   A,2001,1,2,3,1,1\n\
                   B,20x1,1,2,3,1,1\n\
                   C,2001,1,2,3,-4,1\n";
        let data = read_hauls(csv.as_bytes(), &ages()).unwrap();
        assert_eq!(data.rows.len(), 1);
        assert_eq!(data.row_errors.len(), 2);
        assert_eq!(data.row_errors[0].line, 3);
        assert_eq!(data.row_errors[0].id.as_deref(), Some("B"));
    }

    #[test]
    fn missing_age_column_is_a_parse_error() {
        let csv = "year,lon,lat,depth,age_1\n2001,1,2,3,4\n";
        let err = read_hauls(csv.as_bytes(), &ages()).unwrap_err();
        assert!(matches!(err, SurveyIndexError::Parse(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn reads_grid() {
        let csv = "lon,lat,depth,sediment\n1,2,30,0.5\n1.5,2.5,35,\n";
        let data = read_grid(csv.as_bytes()).unwrap();
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[0].extra.get("sediment"), Some(&0.5));
        assert!(data.rows[1].extra.is_empty());
    }

    #[test]
    fn parses_toml_config() {
        let cfg = parse_run_config(
            r#"
            ages = ["1", "2"]
            formula_positive = ["year + s(lon, lat, k = k)", "year"]
            formula_zero = ["year", "year"]
            k_positive = [16, 16]
            k_zero = [9, 9]
            family = "lognormal"
            n_boot = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ages.len(), 2);
        assert_eq!(cfg.n_boot, 0);
        assert!(parse_run_config("ages = 3").is_err());
    }
}
