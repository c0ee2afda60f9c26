//! Pipeline configuration, read from TOML files.
//!
//! A minimal configuration only names the derivatives directory and one atlas:
//!
//! ```toml
//! [pipeline]
//! derivatives_dir = "/data/derivatives/qsiprep"
//!
//! [atlases.brainnetome]
//! image = "/data/atlases/BN_Atlas_274_combined_1mm.nii.gz"
//! labels = "/data/atlases/BNA_with_cerebellum.csv"
//! ```

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::Aggregation;
use crate::error::{ParcellationError, Result};
use crate::label_table::DEFAULT_LABEL_COLUMN;

/// Default gray matter probability threshold for cropping atlases.
pub const DEFAULT_PROBSEG_THRESHOLD: f32 = 0.01;

/// Default tensor-derived metrics to parcellate.
pub const DEFAULT_METRICS: [&str; 4] = ["fa", "adc", "ad", "rd"];


/// The preprocessing pipeline that produced the derivatives. It determines the default file templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    Qsiprep,
    Dmriprep,
}

impl Default for AnalysisSource {
    fn default() -> AnalysisSource {
        AnalysisSource::Qsiprep
    }
}

impl AnalysisSource {
    /// The file templates for derivatives of this source.
    pub fn default_templates(&self) -> FileTemplates {
        let anat = FileTemplates {
            anatomical_reference: "*desc-preproc_T1w.nii*".to_string(),
            mni_to_native_transform: "*from-MNI*_to-T1w_mode-image_xfm.h5".to_string(),
            gm_probability: "*label-GM_probseg.nii*".to_string(),
            dwi: String::new(),
            grad: String::new(),
            tensor: String::new(),
            metric: String::new(),
            results_dir: "dwi".to_string(),
        };
        match self {
            AnalysisSource::Qsiprep => FileTemplates {
                dwi: "dwi/{prefix}_space-T1w_desc-preproc_dwi.nii.gz".to_string(),
                grad: "dwi/{prefix}_space-T1w_desc-preproc_dwi.b".to_string(),
                tensor: "dwi/{prefix}_space-T1w_desc-tensor_epiref.mif".to_string(),
                metric: "dwi/{prefix}_space-T1w_desc-{metric}_epiref.nii.gz".to_string(),
                ..anat
            },
            AnalysisSource::Dmriprep => FileTemplates {
                dwi: "dwi/{prefix}_dir-FWD_space-anat_desc-preproc_dwi.nii.gz".to_string(),
                grad: "dwi/{prefix}_dir-FWD_space-anat_desc-preproc_dwi.b".to_string(),
                tensor: "dwi/{prefix}_dir-FWD_space-anat_desc-tensor_epiref.mif".to_string(),
                metric: "dwi/{prefix}_dir-FWD_space-anat_desc-{metric}_epiref.nii.gz".to_string(),
                ..anat
            },
        }
    }
}


/// File name templates.
///
/// The anatomical templates are glob patterns matched inside the anatomical directory, after the
/// subject (and session) prefix. The other templates are relative to the session directory and may
/// use the placeholders `{prefix}`, `{subject}`, `{session}` and `{metric}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTemplates {
    pub anatomical_reference: String,
    pub mni_to_native_transform: String,
    pub gm_probability: String,
    pub dwi: String,
    pub grad: String,
    pub tensor: String,
    pub metric: String,
    /// Directory, relative to the session directory, that receives the per-session result tables.
    pub results_dir: String,
}


/// Optional overrides of the source's [`FileTemplates`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateOverrides {
    pub anatomical_reference: Option<String>,
    pub mni_to_native_transform: Option<String>,
    pub gm_probability: Option<String>,
    pub dwi: Option<String>,
    pub grad: Option<String>,
    pub tensor: Option<String>,
    pub metric: Option<String>,
    pub results_dir: Option<String>,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// The derivatives directory holding the `sub-*` directories.
    pub derivatives_dir: PathBuf,
    /// Where group tables and the manifest are written. Defaults to `derivatives_dir`.
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// FreeSurfer subjects directory. If set, atlases are also mapped onto each subject's
    /// cortical surfaces and subcortical segmentation.
    #[serde(default)]
    pub freesurfer_dir: Option<PathBuf>,
    #[serde(default)]
    pub source: AnalysisSource,
    /// Whether single-session subjects keep their anatomical derivatives inside the session directory.
    #[serde(default = "default_true")]
    pub longitudinal_sensitive: bool,
    #[serde(default = "default_true")]
    pub crop_to_gm: bool,
    #[serde(default = "default_probseg_threshold")]
    pub probseg_threshold: f32,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    /// Re-run all steps, even if their outputs exist.
    #[serde(default)]
    pub force: bool,
    /// Number of subjects processed in parallel.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub estimate_tensors: bool,
    /// The `desc` entity of per-session result tables.
    #[serde(default = "default_results_desc")]
    pub results_desc: String,
    #[serde(default)]
    pub templates: TemplateOverrides,
}

impl PipelineConfig {
    /// A configuration with default settings for the given derivatives directory.
    pub fn new<P: Into<PathBuf>>(derivatives_dir: P) -> PipelineConfig {
        PipelineConfig {
            derivatives_dir: derivatives_dir.into(),
            destination: None,
            freesurfer_dir: None,
            source: AnalysisSource::default(),
            longitudinal_sensitive: true,
            crop_to_gm: true,
            probseg_threshold: DEFAULT_PROBSEG_THRESHOLD,
            aggregation: Aggregation::default(),
            metrics: default_metrics(),
            force: false,
            jobs: 1,
            estimate_tensors: false,
            results_desc: default_results_desc(),
            templates: TemplateOverrides::default(),
        }
    }

    /// The effective file templates: the source defaults with the configured overrides applied.
    pub fn templates(&self) -> FileTemplates {
        let defaults = self.source.default_templates();
        let o = self.templates.clone();
        FileTemplates {
            anatomical_reference: o.anatomical_reference.unwrap_or(defaults.anatomical_reference),
            mni_to_native_transform: o.mni_to_native_transform.unwrap_or(defaults.mni_to_native_transform),
            gm_probability: o.gm_probability.unwrap_or(defaults.gm_probability),
            dwi: o.dwi.unwrap_or(defaults.dwi),
            grad: o.grad.unwrap_or(defaults.grad),
            tensor: o.tensor.unwrap_or(defaults.tensor),
            metric: o.metric.unwrap_or(defaults.metric),
            results_dir: o.results_dir.unwrap_or(defaults.results_dir),
        }
    }

    pub fn destination(&self) -> PathBuf {
        self.destination.clone().unwrap_or_else(|| self.derivatives_dir.clone())
    }
}


/// Names of the external executables and their limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default = "default_ants_apply_transforms")]
    pub ants_apply_transforms: String,
    #[serde(default = "default_fslmaths")]
    pub fslmaths: String,
    #[serde(default = "default_dwi2tensor")]
    pub dwi2tensor: String,
    #[serde(default = "default_tensor2metric")]
    pub tensor2metric: String,
    #[serde(default = "default_mris_ca_label")]
    pub mris_ca_label: String,
    #[serde(default = "default_mri_ca_label")]
    pub mri_ca_label: String,
    #[serde(default = "default_mris_anatomical_stats")]
    pub mris_anatomical_stats: String,
    #[serde(default = "default_mri_segstats")]
    pub mri_segstats: String,
    #[serde(default = "default_aparcstats2table")]
    pub aparcstats2table: String,
    /// Timeout for a single tool invocation, in seconds. `0` disables the timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> ToolsConfig {
        ToolsConfig {
            ants_apply_transforms: default_ants_apply_transforms(),
            fslmaths: default_fslmaths(),
            dwi2tensor: default_dwi2tensor(),
            tensor2metric: default_tensor2metric(),
            mris_ca_label: default_mris_ca_label(),
            mri_ca_label: default_mri_ca_label(),
            mris_anatomical_stats: default_mris_anatomical_stats(),
            mri_segstats: default_mri_segstats(),
            aparcstats2table: default_aparcstats2table(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }
}


/// Files defining one parcellation scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AtlasConfig {
    /// The label volume in standard (MNI) space.
    pub image: PathBuf,
    /// The CSV label table.
    pub labels: PathBuf,
    #[serde(default = "default_label_column")]
    pub label_column: String,
    /// Column holding the region names. Defaults to the first column.
    #[serde(default)]
    pub name_column: Option<String>,
    /// Further template files of the scheme, e.g., FreeSurfer `gcs` classifiers or a color table.
    #[serde(default)]
    pub auxiliary: BTreeMap<String, PathBuf>,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub atlases: BTreeMap<String, AtlasConfig>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Check the value ranges of the settings.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if !(0.0..=1.0).contains(&p.probseg_threshold) {
            return Err(ParcellationError::InvalidConfig(format!(
                "probseg_threshold must be within [0, 1], got {}", p.probseg_threshold)));
        }
        if p.metrics.is_empty() {
            return Err(ParcellationError::InvalidConfig("at least one metric is required".to_string()));
        }
        if p.jobs == 0 {
            return Err(ParcellationError::InvalidConfig("jobs must be at least 1".to_string()));
        }
        if self.atlases.is_empty() {
            return Err(ParcellationError::InvalidConfig("no atlases configured".to_string()));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ParcellationError;

    fn from_str(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}


fn default_true() -> bool {
    true
}

fn default_probseg_threshold() -> f32 {
    DEFAULT_PROBSEG_THRESHOLD
}

fn default_metrics() -> Vec<String> {
    DEFAULT_METRICS.iter().map(|m| m.to_string()).collect()
}

fn default_jobs() -> usize {
    1
}

fn default_results_desc() -> String {
    "TensorMetrics".to_string()
}

fn default_ants_apply_transforms() -> String {
    "antsApplyTransforms".to_string()
}

fn default_fslmaths() -> String {
    "fslmaths".to_string()
}

fn default_dwi2tensor() -> String {
    "dwi2tensor".to_string()
}

fn default_mris_ca_label() -> String {
    "mris_ca_label".to_string()
}

fn default_mri_ca_label() -> String {
    "mri_ca_label".to_string()
}

fn default_mris_anatomical_stats() -> String {
    "mris_anatomical_stats".to_string()
}

fn default_mri_segstats() -> String {
    "mri_segstats".to_string()
}

fn default_aparcstats2table() -> String {
    "aparcstats2table".to_string()
}

fn default_tensor2metric() -> String {
    "tensor2metric".to_string()
}

fn default_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_label_column() -> String {
    DEFAULT_LABEL_COLUMN.to_string()
}
