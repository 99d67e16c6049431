//! CSV ingestion of observation records and CSV output of results.

use crate::calendar::{decimal_year, parse_date};
use crate::config::{DatasetConfig, TimeFormat, ValueKind};
use crate::model::{Observation, Series};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Reference year of fraction modern.
const FM_REFERENCE_YEAR: f64 = 1950.0;
/// Mean life of radiocarbon in years.
const MEAN_LIFE: f64 = 8267.0;

/// Convert fraction modern and its uncertainty to Δ14C in permil at `year`.
pub fn fm_to_d14c(fm: f64, fm_unc: f64, year: f64) -> (f64, f64) {
    let decay = ((FM_REFERENCE_YEAR - year) / MEAN_LIFE).exp();
    (1000.0 * (fm * decay - 1.0), 1000.0 * fm_unc * decay)
}

struct Columns {
    time: usize,
    value: usize,
    uncertainty: usize,
}

/// Load the record described by `cfg` from `file`.
///
/// Rows with missing or unparseable fields, non-finite numbers or negative
/// uncertainties are skipped and counted.
///
/// # Errors
/// Returns an error if the file cannot be read, a configured column is
/// missing or the remaining observations do not form a valid series.
pub fn load_dataset<P: AsRef<Path>>(file: P, cfg: &DatasetConfig) -> Result<Series> {
    let file = file.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(file)
        .with_context(|| format!("failed to open {file:?}"))?;

    let headers = reader.headers().context("failed to read header")?.clone();
    let find = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .with_context(|| format!("column {name} not found in {file:?}"))
    };
    let cols = Columns {
        time: find(&cfg.time_column)?,
        value: find(&cfg.value_column)?,
        uncertainty: find(&cfg.uncertainty_column)?,
    };

    let mut obs_vec = Vec::new();
    let mut n_skipped = 0;
    for (i_row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read row {i_row}"))?;
        match parse_row(&record, &cols, cfg) {
            Some(obs) => obs_vec.push(obs),
            None => {
                log::debug!("skipped row {i_row} of {file:?}: {record:?}");
                n_skipped += 1;
            }
        }
    }

    log::info!(
        "loaded {} observations of {} from {file:?}",
        obs_vec.len(),
        cfg.name
    );
    if n_skipped > 0 {
        log::warn!("skipped {n_skipped} rows of {}", cfg.name);
    }

    Series::from_observations(&obs_vec).with_context(|| format!("invalid dataset {}", cfg.name))
}

fn parse_row(record: &csv::StringRecord, cols: &Columns, cfg: &DatasetConfig) -> Option<Observation> {
    let time_field = record.get(cols.time)?;
    let time = match cfg.time_format {
        TimeFormat::Decimal => time_field.parse::<f64>().ok()?,
        TimeFormat::Date => decimal_year(parse_date(time_field, cfg.date_format.as_deref()?)?),
    };
    let value = record.get(cols.value)?.parse::<f64>().ok()?;
    let uncertainty = record.get(cols.uncertainty)?.parse::<f64>().ok()?;

    let (value, uncertainty) = match cfg.value_kind {
        ValueKind::D14c => (value, uncertainty),
        ValueKind::Fm => fm_to_d14c(value, uncertainty, time),
    };

    let finite = time.is_finite() && value.is_finite() && uncertainty.is_finite();
    if !finite || uncertainty < 0.0 {
        return None;
    }
    Some(Observation {
        time,
        value,
        uncertainty,
    })
}

/// Write `rows` to a CSV file with a header derived from their fields.
pub fn write_rows<P, I, S>(file: P, rows: I) -> Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: Serialize,
{
    let file = file.as_ref();
    let mut writer =
        csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;
    for row in rows {
        writer.serialize(row).context("failed to serialize row")?;
    }
    writer.flush().with_context(|| format!("failed to flush {file:?}"))?;

    log::info!("wrote {file:?}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, path::PathBuf};

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let file = env::temp_dir().join(format!("intercomp-data-{}-{name}", std::process::id()));
        fs::write(&file, contents).unwrap();
        file
    }

    fn dataset(time_column: &str, value_column: &str, uncertainty_column: &str) -> DatasetConfig {
        DatasetConfig {
            name: "test".to_string(),
            file: PathBuf::from("unused.csv"),
            time_column: time_column.to_string(),
            value_column: value_column.to_string(),
            uncertainty_column: uncertainty_column.to_string(),
            time_format: TimeFormat::Decimal,
            date_format: None,
            value_kind: ValueKind::D14c,
        }
    }

    #[test]
    fn loads_decimal_years_and_skips_bad_rows() {
        let file = temp_file(
            "decimal.csv",
            "site,time,d14c,err\n\
             BHD,1990.5,150.0,2.0\n\
             BHD,1990.1,152.0,2.5\n\
             BHD,,151.0,2.0\n\
             BHD,1990.3,n/a,2.0\n\
             BHD,1990.4,149.0,-9.0\n",
        );
        let series = load_dataset(&file, &dataset("time", "d14c", "err")).unwrap();
        fs::remove_file(&file).ok();

        assert_eq!(series.times(), &[1990.1, 1990.5]);
        assert_eq!(series.values(), &[152.0, 150.0]);
        assert_eq!(series.uncertainties(), &[2.5, 2.0]);
    }

    #[test]
    fn converts_dates_and_fraction_modern() {
        let file = temp_file(
            "dates.csv",
            "date,fm,fm_err\n\
             1991-07-02,1.1,0.002\n",
        );
        let mut cfg = dataset("date", "fm", "fm_err");
        cfg.time_format = TimeFormat::Date;
        cfg.date_format = Some("%Y-%m-%d".to_string());
        cfg.value_kind = ValueKind::Fm;

        let series = load_dataset(&file, &cfg).unwrap();
        fs::remove_file(&file).ok();

        let time = 1991.0 + 182.0 / 365.0;
        assert!((series.times()[0] - time).abs() < 1e-12);
        let decay = ((1950.0 - time) / 8267.0).exp();
        assert!((series.values()[0] - 1000.0 * (1.1 * decay - 1.0)).abs() < 1e-9);
        assert!((series.uncertainties()[0] - 2.0 * decay).abs() < 1e-9);
    }

    #[test]
    fn fraction_modern_of_one_in_1950_is_zero() {
        let (d14c, unc) = fm_to_d14c(1.0, 0.003, 1950.0);
        assert!(d14c.abs() < 1e-12);
        assert!((unc - 3.0).abs() < 1e-12);
    }

    #[test]
    fn missing_column_fails() {
        let file = temp_file("missing.csv", "time,d14c\n1990.0,150.0\n");
        let result = load_dataset(&file, &dataset("time", "d14c", "err"));
        fs::remove_file(&file).ok();
        assert!(result.is_err());
    }

    #[test]
    fn writes_header_and_rows() {
        let file = env::temp_dir().join(format!("intercomp-data-{}-out.csv", std::process::id()));
        let rows = vec![
            Observation {
                time: 1990.5,
                value: 150.0,
                uncertainty: 2.0,
            },
            Observation {
                time: 1991.5,
                value: 140.0,
                uncertainty: 1.5,
            },
        ];
        write_rows(&file, &rows).unwrap();
        let contents = fs::read_to_string(&file).unwrap();
        fs::remove_file(&file).ok();

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["time,value,uncertainty", "1990.5,150.0,2.0", "1991.5,140.0,1.5"]);
    }
}
