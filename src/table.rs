//! Tables of region values, with rows per subject and session and columns per region and metric.
//!
//! Tables are persisted as CSV with two column header levels, in the layout pandas uses for
//! `MultiIndex` data frames:
//!
//! ```text
//! region,,A8m_L,A8m_L,A8m_R,A8m_R
//! metric,,fa,adc,fa,adc
//! subject,session,,,,
//! 01,1,0.41,0.00081,0.39,0.00079
//! ```
//!
//! Missing values (NaN) are written as empty cells. A missing session is an empty session cell.

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{ParcellationError, Result};


#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub subject: String,
    pub session: Option<String>,
}

impl RowKey {
    pub fn new<S: Into<String>>(subject: S, session: Option<&str>) -> RowKey {
        RowKey { subject: subject.into(), session: session.map(|s| s.to_string()) }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnKey {
    pub region: String,
    pub metric: String,
}

impl ColumnKey {
    pub fn new<R: Into<String>, M: Into<String>>(region: R, metric: M) -> ColumnKey {
        ColumnKey { region: region.into(), metric: metric.into() }
    }
}


/// A single value in long format.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionValue {
    pub subject: String,
    pub session: Option<String>,
    pub region: String,
    pub metric: String,
    pub value: f64,
}


#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    columns: Vec<ColumnKey>,
    rows: Vec<RowKey>,
    values: Vec<Vec<f64>>,
}

impl ResultTable {
    /// An empty table with the given columns.
    pub fn new(columns: Vec<ColumnKey>) -> ResultTable {
        ResultTable { columns, rows: Vec::new(), values: Vec::new() }
    }

    /// An empty table with the product of regions (outer) and metrics (inner) as columns.
    pub fn from_product<R: AsRef<str>, M: AsRef<str>>(regions: &[R], metrics: &[M]) -> ResultTable {
        let columns = regions.iter()
            .flat_map(|r| metrics.iter().map(move |m| ColumnKey::new(r.as_ref(), m.as_ref())))
            .collect();
        ResultTable::new(columns)
    }

    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    pub fn rows(&self) -> &[RowKey] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row. `values` are in column order.
    pub fn push_row(&mut self, key: RowKey, values: Vec<f64>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(ParcellationError::InvalidResultTable(format!(
                "row has {} values, but the table has {} columns", values.len(), self.columns.len())));
        }
        self.rows.push(key);
        self.values.push(values);
        Ok(())
    }

    /// The values of a row, in column order.
    pub fn row(&self, key: &RowKey) -> Option<&[f64]> {
        self.rows.iter().position(|r| r == key).map(|idx| self.values[idx].as_slice())
    }

    pub fn get(&self, key: &RowKey, column: &ColumnKey) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.row(key).map(|r| r[col])
    }

    /// Stack tables vertically, keeping their row order.
    ///
    /// The columns of the result are the union of all column sets, in order of first
    /// appearance. Cells of columns a table does not have are NaN.
    pub fn concat(tables: &[ResultTable]) -> ResultTable {
        let mut columns: Vec<ColumnKey> = Vec::new();
        let mut seen: HashSet<ColumnKey> = HashSet::new();
        for col in tables.iter().flat_map(|t| t.columns.iter()) {
            if seen.insert(col.clone()) {
                columns.push(col.clone());
            }
        }
        let index: HashMap<&ColumnKey, usize> = columns.iter().enumerate().map(|(i, c)| (c, i)).collect();

        let mut rows = Vec::new();
        let mut values = Vec::new();
        for table in tables {
            let positions: Vec<usize> = table.columns.iter().map(|c| index[c]).collect();
            for (key, row) in table.rows.iter().zip(table.values.iter()) {
                let mut aligned = vec![f64::NAN; columns.len()];
                for (pos, v) in positions.iter().zip(row.iter()) {
                    aligned[*pos] = *v;
                }
                rows.push(key.clone());
                values.push(aligned);
            }
        }
        ResultTable { columns, rows, values }
    }

    /// All cells in long format, row by row.
    pub fn region_values(&self) -> Vec<RegionValue> {
        let mut long = Vec::with_capacity(self.rows.len() * self.columns.len());
        for (key, row) in self.rows.iter().zip(self.values.iter()) {
            for (col, value) in self.columns.iter().zip(row.iter()) {
                long.push(RegionValue {
                    subject: key.subject.clone(),
                    session: key.session.clone(),
                    region: col.region.clone(),
                    metric: col.metric.clone(),
                    value: *value,
                });
            }
        }
        long
    }

    /// Write the table as CSV.
    pub fn to_writer<W: Write>(&self, output: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().from_writer(output);

        let regions = self.columns.iter().map(|c| c.region.as_str());
        let metrics = self.columns.iter().map(|c| c.metric.as_str());
        wtr.write_record(["region", ""].iter().copied().chain(regions))?;
        wtr.write_record(["metric", ""].iter().copied().chain(metrics))?;
        wtr.write_record(["subject", "session"].iter().copied().chain(self.columns.iter().map(|_| "")))?;

        for (key, row) in self.rows.iter().zip(self.values.iter()) {
            let mut rec = vec![key.subject.clone(), key.session.clone().unwrap_or_default()];
            rec.extend(row.iter().map(|v| format_value(*v)));
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        self.to_writer(file)
    }

    /// Read a table from CSV data, see [`ResultTable::to_writer`] for the layout.
    pub fn from_reader<R: Read>(input: R) -> Result<ResultTable> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(false)
            .from_reader(input);
        let mut records = rdr.records();

        let mut next_header = |level: &str| -> Result<StringRecord> {
            let rec = records.next()
                .ok_or_else(|| ParcellationError::InvalidResultTable(format!("missing '{}' header row", level)))??;
            if rec.get(0) != Some(level) {
                return Err(ParcellationError::InvalidResultTable(format!("expected '{}' header row", level)));
            }
            Ok(rec)
        };
        let regions = next_header("region")?;
        let metrics = next_header("metric")?;
        let names = next_header("subject")?;
        if regions.len() < 2 || names.get(1) != Some("session") {
            return Err(ParcellationError::InvalidResultTable("expected 'subject' and 'session' index columns".to_string()));
        }

        let columns = regions.iter().zip(metrics.iter()).skip(2)
            .map(|(r, m)| ColumnKey::new(r, m))
            .collect();
        let mut table = ResultTable::new(columns);

        for result in records {
            let rec = result?;
            let subject = rec.get(0).unwrap_or("");
            let session = rec.get(1).filter(|s| !s.is_empty());
            let values = rec.iter().skip(2).map(parse_value).collect::<Result<Vec<f64>>>()?;
            table.push_row(RowKey::new(subject, session), values)?;
        }
        Ok(table)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ResultTable> {
        let file = BufReader::new(File::open(path)?);
        ResultTable::from_reader(file)
    }
}


impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Result table with {} rows and {} columns.", self.rows.len(), self.columns.len())
    }
}


/// Shortest representation that parses back to the same value. NaN is an empty cell.
fn format_value(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        format!("{}", v)
    }
}


fn parse_value(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>().map_err(|_| ParcellationError::InvalidResultTable(format!("invalid value '{}'", raw)))
}


/// Read a result table from a CSV file.
pub fn read_result_table<P: AsRef<Path>>(path: P) -> Result<ResultTable> {
    ResultTable::from_file(path)
}
