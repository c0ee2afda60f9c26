use quick_error::quick_error;
use std::io::Error as IOError;
use std::path::PathBuf;

quick_error! {
    /// Error type for all error variants originated by this crate.
    #[derive(Debug)]
    pub enum ParcellationError {
        /// Invalid MGH file: wrong format version.
        InvalidFsMghFormat {
            display("Invalid FreeSurfer MGH file")
        }

        UnsupportedMghDataType(code: i32) {
            display("Unsupported MGH data type code {}", code)
        }

        UnsupportedVolumeFormat(path: PathBuf) {
            display("Unsupported volume file format: {}", path.display())
        }

        /// The volume does not have 3 or 4 dimensions, or a label volume has more than one frame.
        InvalidVolumeShape(shape: Vec<usize>) {
            display("Invalid volume shape {:?}", shape)
        }

        /// A required upstream derivative could not be located.
        MissingInput(subject: String, what: String, location: String) {
            display("Missing {} for subject {} (looked for {})", what, subject, location)
        }

        /// Label and metric grids differ, even after nearest-neighbor resampling.
        ShapeMismatch(labels: Vec<usize>, metric: Vec<usize>) {
            display("Label volume shape {:?} does not match metric volume shape {:?}", labels, metric)
        }

        UnknownParcellationScheme(scheme: String, available: String) {
            display("Unknown parcellation scheme '{}', available: {}", scheme, available)
        }

        MissingTemplateImage(scheme: String, path: PathBuf) {
            display("Template image of atlas '{}' not found: {}", scheme, path.display())
        }

        InvalidLabelTable(msg: String) {
            display("Invalid label table: {}", msg)
        }

        DuplicateLabel(label: i32) {
            display("Label {} appears more than once in the label table", label)
        }

        InvalidConfig(msg: String) {
            display("Invalid configuration: {}", msg)
        }

        InvalidResultTable(msg: String) {
            display("Invalid result table: {}", msg)
        }

        /// An external tool exited abnormally or did not produce its outputs.
        ExternalToolFailure(tool: String, reason: String) {
            display("External tool {} failed: {}", tool, reason)
        }

        ExternalToolTimeout(tool: String, secs: u64) {
            display("External tool {} timed out after {} s", tool, secs)
        }

        /// I/O Error
        Io(err: IOError) {
            from()
            source(err)
        }

        Csv(err: csv::Error) {
            from()
            display("CSV error: {}", err)
            source(err)
        }

        Nifti(err: nifti::NiftiError) {
            from()
            display("NIfTI error: {}", err)
            source(err)
        }

        Toml(err: toml::de::Error) {
            from()
            display("TOML error: {}", err)
            source(err)
        }

        Pattern(err: glob::PatternError) {
            from()
            display("Invalid glob pattern: {}", err)
            source(err)
        }
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, ParcellationError>;
