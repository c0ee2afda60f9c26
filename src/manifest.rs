//! Per-session record of how far processing got.

use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::Result;


/// Processing stages of a session, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unregistered,
    RegisteredWholeBrain,
    RegisteredGmCropped,
    Parcellated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Stage::Unregistered => "unregistered",
            Stage::RegisteredWholeBrain => "registered_whole_brain",
            Stage::RegisteredGmCropped => "registered_gm_cropped",
            Stage::Parcellated => "parcellated",
        };
        write!(f, "{}", name)
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub subject: String,
    pub session: Option<String>,
    /// The last stage reached.
    pub stage: Stage,
    /// Whether whole-brain region values were produced.
    pub whole_brain: bool,
    /// Whether GM-cropped region values were produced.
    pub gm_cropped: bool,
    /// Why processing stopped early, if it did.
    pub failure: Option<String>,
}

impl ManifestEntry {
    pub fn new<S: Into<String>>(subject: S, session: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            subject: subject.into(),
            session: session.map(|s| s.to_string()),
            stage: Stage::Unregistered,
            whole_brain: false,
            gm_cropped: false,
            failure: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}


/// The entries of a pipeline run, in subject and session order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Manifest {
        Manifest { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.is_failed())
    }

    pub fn entry(&self, subject: &str, session: Option<&str>) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.subject == subject && e.session.as_deref() == session)
    }

    /// Write as CSV with the columns `subject,session,stage,whole_brain,gm_cropped,failure`.
    pub fn to_writer<W: Write>(&self, output: W) -> Result<()> {
        let mut wtr = WriterBuilder::new().has_headers(true).from_writer(output);
        for entry in &self.entries {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        self.to_writer(file)
    }

    pub fn from_reader<R: Read>(input: R) -> Result<Manifest> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(input);
        let entries = rdr.deserialize().collect::<std::result::Result<Vec<ManifestEntry>, csv::Error>>()?;
        Ok(Manifest { entries })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Manifest> {
        let file = BufReader::new(File::open(path)?);
        Manifest::from_reader(file)
    }
}


impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Manifest of {} sessions, {} failed.", self.entries.len(), self.failures().count())
    }
}
