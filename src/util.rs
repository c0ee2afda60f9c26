//! Utility functions used in all other neuroparc modules.

use std::path::Path;

/// Check whether the file extension ends with ".gz".
pub fn is_gz_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    path.as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().ends_with(".gz"))
        .unwrap_or(false)
}


/// Get the full, possibly multi-part, extension of a file name, e.g. ".nii.gz" for "brain.nii.gz". Returns an empty string if there is none.
pub fn full_extension<P>(path: P) -> String
where
    P: AsRef<Path>,
{
    let name = path.as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.find('.') {
        Some(idx) => name[idx..].to_string(),
        None => String::new(),
    }
}
