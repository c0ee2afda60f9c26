//! Surface-based parcellation with FreeSurfer: file layout of a subjects directory and the
//! outputs of the per-subject and group steps.
//!
//! Atlases take part in this stage through their auxiliary templates: a per-hemisphere cortical
//! classifier (`gcs`, with a `{hemi}` placeholder), and optionally a subcortical classifier
//! (`gcs_subcortex`) together with a color table (`ctab`).

use std::fmt;
use std::path::{Path, PathBuf};


/// Auxiliary template key of the cortical classifier, e.g. `/atlases/{hemi}.BN_Atlas.gcs`.
pub const AUX_GCS: &str = "gcs";
/// Auxiliary template key of the subcortical classifier (`.gca`).
pub const AUX_GCS_SUBCORTEX: &str = "gcs_subcortex";
/// Auxiliary template key of the color lookup table of the scheme.
pub const AUX_CTAB: &str = "ctab";


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hemisphere {
    Left,
    Right,
}

impl Hemisphere {
    pub const ALL: [Hemisphere; 2] = [Hemisphere::Left, Hemisphere::Right];

    /// `lh` or `rh`.
    pub fn name(&self) -> &'static str {
        match self {
            Hemisphere::Left => "lh",
            Hemisphere::Right => "rh",
        }
    }
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}


/// A per-region surface measure that `aparcstats2table` can collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceMeasure {
    Area,
    Volume,
    Thickness,
    ThicknessStd,
    MeanCurv,
}

impl SurfaceMeasure {
    pub const ALL: [SurfaceMeasure; 5] = [
        SurfaceMeasure::Area,
        SurfaceMeasure::Volume,
        SurfaceMeasure::Thickness,
        SurfaceMeasure::ThicknessStd,
        SurfaceMeasure::MeanCurv,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SurfaceMeasure::Area => "area",
            SurfaceMeasure::Volume => "volume",
            SurfaceMeasure::Thickness => "thickness",
            SurfaceMeasure::ThicknessStd => "thicknessstd",
            SurfaceMeasure::MeanCurv => "meancurv",
        }
    }
}

impl fmt::Display for SurfaceMeasure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}


/// Fill in the `{hemi}` placeholder of a per-hemisphere template path.
pub fn render_hemisphere(template: &Path, hemi: Hemisphere) -> PathBuf {
    PathBuf::from(template.to_string_lossy().replace("{hemi}", hemi.name()))
}


/// Paths inside a FreeSurfer subjects directory (`SUBJECTS_DIR`).
///
/// FreeSurfer subjects are named `sub-<id>`, like the derivatives subject directories.
#[derive(Debug, Clone, PartialEq)]
pub struct FreesurferLayout {
    subjects_dir: PathBuf,
}

impl FreesurferLayout {
    pub fn new<P: Into<PathBuf>>(subjects_dir: P) -> FreesurferLayout {
        FreesurferLayout { subjects_dir: subjects_dir.into() }
    }

    pub fn subjects_dir(&self) -> &Path {
        &self.subjects_dir
    }

    pub fn subject_id(&self, subject: &str) -> String {
        format!("sub-{}", subject)
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.subjects_dir.join(self.subject_id(subject))
    }

    /// The spherical registration surface, `surf/<hemi>.sphere.reg`.
    pub fn sphere_reg(&self, subject: &str, hemi: Hemisphere) -> PathBuf {
        self.subject_dir(subject).join("surf").join(format!("{}.sphere.reg", hemi))
    }

    pub fn thickness(&self, subject: &str, hemi: Hemisphere) -> PathBuf {
        self.subject_dir(subject).join("surf").join(format!("{}.thickness", hemi))
    }

    pub fn annotation(&self, subject: &str, hemi: Hemisphere, scheme: &str) -> PathBuf {
        self.subject_dir(subject).join("label").join(format!("{}.{}.annot", hemi, scheme))
    }

    /// The color table written along with the anatomical statistics. Shared by both hemispheres.
    pub fn color_table(&self, subject: &str, scheme: &str) -> PathBuf {
        self.subject_dir(subject).join("label").join(format!("aparc.annot.{}.ctab", scheme))
    }

    /// Per-region surface statistics, the input of `aparcstats2table --parc=<scheme>`.
    pub fn stats(&self, subject: &str, hemi: Hemisphere, scheme: &str) -> PathBuf {
        self.subject_dir(subject).join("stats").join(format!("{}.{}.stats", hemi, scheme))
    }

    pub fn brain(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("mri").join("brain.mgz")
    }

    /// The nonlinear talairach transform used by subcortical labeling.
    pub fn talairach(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("mri").join("transforms").join("talairach.m3z")
    }

    pub fn subcortex(&self, subject: &str, scheme: &str) -> PathBuf {
        self.subject_dir(subject).join("mri").join(format!("{}_subcortex.mgz", scheme))
    }

    pub fn subcortex_stats(&self, subject: &str, scheme: &str) -> PathBuf {
        self.subject_dir(subject).join("stats").join(format!("subcortex.{}.stats", scheme))
    }
}


/// The group table of one hemisphere and measure, `<dir>/<hemi>_<scheme>_<measure>.csv`.
pub fn group_table_path(dir: &Path, hemi: Hemisphere, scheme: &str, measure: SurfaceMeasure) -> PathBuf {
    dir.join(format!("{}_{}_{}.csv", hemi, scheme, measure))
}


/// The FreeSurfer outputs of one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct FreesurferSubject {
    pub subject: String,
    /// Surface statistics, one file per hemisphere.
    pub stats: Vec<PathBuf>,
    /// `None` if the scheme has no subcortical classifier.
    pub subcortex_stats: Option<PathBuf>,
    pub failure: Option<String>,
}

impl FreesurferSubject {
    pub fn new<S: Into<String>>(subject: S) -> FreesurferSubject {
        FreesurferSubject { subject: subject.into(), stats: Vec::new(), subcortex_stats: None, failure: None }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}


/// The outcome of the FreeSurfer stage of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreesurferReport {
    pub subjects: Vec<FreesurferSubject>,
    /// Group tables by hemisphere and measure, across all subjects without failures.
    pub group_tables: Vec<PathBuf>,
    /// Set if grouping failed. Per-subject outputs are still valid then.
    pub group_failure: Option<String>,
}

impl FreesurferReport {
    pub fn failures(&self) -> impl Iterator<Item = &FreesurferSubject> {
        self.subjects.iter().filter(|s| s.is_failed())
    }

    pub fn subject(&self, subject: &str) -> Option<&FreesurferSubject> {
        self.subjects.iter().find(|s| s.subject == subject)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subject_paths_follow_the_freesurfer_layout() {
        let fs = FreesurferLayout::new("/data/freesurfer");
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/surf/lh.sphere.reg"), fs.sphere_reg("01", Hemisphere::Left));
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/label/rh.brainnetome.annot"),
            fs.annotation("01", Hemisphere::Right, "brainnetome"));
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/stats/lh.brainnetome.stats"),
            fs.stats("01", Hemisphere::Left, "brainnetome"));
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/label/aparc.annot.brainnetome.ctab"),
            fs.color_table("01", "brainnetome"));
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/mri/brainnetome_subcortex.mgz"), fs.subcortex("01", "brainnetome"));
        assert_eq!(PathBuf::from("/data/freesurfer/sub-01/stats/subcortex.brainnetome.stats"),
            fs.subcortex_stats("01", "brainnetome"));
    }

    #[test]
    fn hemisphere_templates_are_rendered() {
        let gcs = Path::new("/atlases/{hemi}.BN_Atlas.gcs");
        assert_eq!(PathBuf::from("/atlases/lh.BN_Atlas.gcs"), render_hemisphere(gcs, Hemisphere::Left));
        assert_eq!(PathBuf::from("/atlases/rh.BN_Atlas.gcs"), render_hemisphere(gcs, Hemisphere::Right));
    }

    #[test]
    fn group_tables_are_named_by_hemisphere_and_measure() {
        let path = group_table_path(Path::new("/out"), Hemisphere::Right, "brainnetome", SurfaceMeasure::ThicknessStd);
        assert_eq!(PathBuf::from("/out/rh_brainnetome_thicknessstd.csv"), path);
        assert_eq!(5, SurfaceMeasure::ALL.len());
    }
}
