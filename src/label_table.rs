//! Functions for reading the label tables of brain atlases.
//!
//! A label table lists the integer label of each atlas region, together with the region's name.
//! It is read from a CSV file with a `Label` column, like the parcel tables shipped with the
//! Brainnetome atlas.

use csv::ReaderBuilder;

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{ParcellationError, Result};

/// The default name of the column holding the integer labels.
pub const DEFAULT_LABEL_COLUMN: &str = "Label";


/// An ordered list of atlas regions. Label ids are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    pub label: Vec<i32>,
    pub name: Vec<String>,
}


impl LabelTable {

    /// Construct a label table from (label, name) pairs.
    ///
    /// # Errors
    ///
    /// If a label appears more than once.
    pub fn from_pairs<I, S>(pairs: I) -> Result<LabelTable>
    where
        I: IntoIterator<Item = (i32, S)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut table = LabelTable { label: Vec::new(), name: Vec::new() };
        for (label, name) in pairs {
            if !seen.insert(label) {
                return Err(ParcellationError::DuplicateLabel(label));
            }
            table.label.push(label);
            table.name.push(name.into());
        }
        Ok(table)
    }


    /// Read a label table from a CSV file.
    ///
    /// # Parameters
    ///
    /// * `label_column`: name of the column containing the integer labels, typically [`DEFAULT_LABEL_COLUMN`].
    /// * `name_column`: name of the column containing the region names. If `None`, the first column is used, which is what pandas treats as the index of such tables.
    pub fn from_file<P: AsRef<Path>>(path: P, label_column: &str, name_column: Option<&str>) -> Result<LabelTable> {
        let file = BufReader::new(File::open(path)?);
        LabelTable::from_reader(file, label_column, name_column)
    }


    /// Read a label table from CSV data, see [`LabelTable::from_file`].
    pub fn from_reader<R: Read>(input: R, label_column: &str, name_column: Option<&str>) -> Result<LabelTable> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::All)
            .from_reader(input);

        let headers = rdr.headers()?.clone();
        let label_idx = headers.iter().position(|h| h == label_column)
            .ok_or_else(|| ParcellationError::InvalidLabelTable(format!("no '{}' column", label_column)))?;
        let name_idx = match name_column {
            Some(col) => headers.iter().position(|h| h == col)
                .ok_or_else(|| ParcellationError::InvalidLabelTable(format!("no '{}' column", col)))?,
            None => 0,
        };

        let mut pairs = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let raw_label = record.get(label_idx).unwrap_or("");
            let label = parse_label(raw_label)
                .ok_or_else(|| ParcellationError::InvalidLabelTable(format!("invalid label '{}'", raw_label)))?;
            let name = record.get(name_idx).unwrap_or("").to_string();
            pairs.push((label, name));
        }
        LabelTable::from_pairs(pairs)
    }


    pub fn len(&self) -> usize {
        self.label.len()
    }


    pub fn is_empty(&self) -> bool {
        self.label.is_empty()
    }


    /// Get the region names, in table order.
    pub fn regions(&self) -> &[String] {
        &self.name
    }


    /// Iterate over (label, region name) pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.label.iter().copied().zip(self.name.iter().map(|s| s.as_str()))
    }


    /// Get the name of the region with the given label, if any.
    pub fn region_name(&self, label: i32) -> Option<&str> {
        self.label.iter().position(|l| *l == label).map(|idx| self.name[idx].as_str())
    }
}


impl fmt::Display for LabelTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Label table for {} brain regions.", self.label.len())
    }
}


/// Parse a label cell. Integral floats like `12.0` are accepted, since pandas writes integer columns with missing values that way.
fn parse_label(raw: &str) -> Option<i32> {
    if let Ok(v) = raw.parse::<i32>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    if v.fract() == 0.0 && v.abs() <= i32::MAX as f64 {
        Some(v as i32)
    } else {
        None
    }
}


/// Read a label table from a CSV file, using the `Label` column and the first column for region names.
///
/// # Examples
///
/// ```no_run
/// let table = neuroparc::read_label_table("/path/to/BNA_with_cerebellum.csv").unwrap();
/// println!("{}", table);
/// ```
pub fn read_label_table<P: AsRef<Path>>(path: P) -> Result<LabelTable> {
    LabelTable::from_file(path, DEFAULT_LABEL_COLUMN, None)
}
