//! Invocations of the external registration, masking, tensor fitting and FreeSurfer tools.
//!
//! Each tool call is a plain struct listing its inputs, outputs and options. A [`ToolRunner`]
//! executes them; [`CommandRunner`] does so in a subprocess.

use tracing::{debug, warn, Span};
use wait_timeout::ChildExt;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::ToolsConfig;
use crate::error::{ParcellationError, Result};
use crate::freesurfer::{Hemisphere, SurfaceMeasure};

/// Seed of the random number generator of `mris_ca_label`, fixed for reproducible annotations.
pub const CA_LABEL_SEED: u32 = 42;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbor,
    Linear,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Interpolation::NearestNeighbor => write!(f, "NearestNeighbor"),
            Interpolation::Linear => write!(f, "Linear"),
        }
    }
}


/// Which voxels a threshold zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDirection {
    /// Zero voxels below the threshold.
    Below,
    /// Zero voxels above the threshold.
    Above,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDatatype {
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl fmt::Display for OutputDatatype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OutputDatatype::Char => "char",
            OutputDatatype::Short => "short",
            OutputDatatype::Int => "int",
            OutputDatatype::Float => "float",
            OutputDatatype::Double => "double",
        };
        write!(f, "{}", name)
    }
}


/// A metric that `tensor2metric` can derive from a diffusion tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorMetric {
    Fa,
    Adc,
    Ad,
    Rd,
    Cl,
    Cp,
    Cs,
    Eval,
    Evec,
}

impl TensorMetric {
    /// The metric name, as used in file names.
    pub fn name(&self) -> &'static str {
        match self {
            TensorMetric::Fa => "fa",
            TensorMetric::Adc => "adc",
            TensorMetric::Ad => "ad",
            TensorMetric::Rd => "rd",
            TensorMetric::Cl => "cl",
            TensorMetric::Cp => "cp",
            TensorMetric::Cs => "cs",
            TensorMetric::Eval => "eval",
            TensorMetric::Evec => "evec",
        }
    }

    /// The `tensor2metric` option that writes this metric.
    pub fn flag(&self) -> &'static str {
        match self {
            TensorMetric::Eval => "-value",
            TensorMetric::Evec => "-vector",
            TensorMetric::Fa => "-fa",
            TensorMetric::Adc => "-adc",
            TensorMetric::Ad => "-ad",
            TensorMetric::Rd => "-rd",
            TensorMetric::Cl => "-cl",
            TensorMetric::Cp => "-cp",
            TensorMetric::Cs => "-cs",
        }
    }

    /// Look up a metric by name. Returns `None` for metrics not derived from tensors.
    pub fn from_name(name: &str) -> Option<TensorMetric> {
        let all = [
            TensorMetric::Fa, TensorMetric::Adc, TensorMetric::Ad, TensorMetric::Rd, TensorMetric::Cl,
            TensorMetric::Cp, TensorMetric::Cs, TensorMetric::Eval, TensorMetric::Evec,
        ];
        all.iter().copied().find(|m| m.name() == name)
    }
}


/// Apply a transform to an image, `antsApplyTransforms`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyTransforms {
    pub input: PathBuf,
    pub reference: PathBuf,
    pub transform: PathBuf,
    pub output: PathBuf,
    pub interpolation: Interpolation,
}

/// Binarize an image at a threshold, `fslmaths <in> -thr <t> -bin <out>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub input: PathBuf,
    pub threshold: f32,
    pub direction: ThresholdDirection,
    pub output: PathBuf,
}

/// Mask an image, `fslmaths <in> -mas <mask> <out> -odt <datatype>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyMask {
    pub input: PathBuf,
    pub mask: PathBuf,
    pub output: PathBuf,
    pub datatype: OutputDatatype,
}

/// Fit diffusion tensors, `dwi2tensor`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitTensor {
    pub dwi: PathBuf,
    pub grad: PathBuf,
    pub output: PathBuf,
}

/// Derive metric images from a tensor image, `tensor2metric`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMetrics {
    pub tensor: PathBuf,
    pub outputs: Vec<(TensorMetric, PathBuf)>,
}

/// Label the cortical surface of a hemisphere with a classifier, `mris_ca_label`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaLabel {
    pub subjects_dir: PathBuf,
    pub subject: String,
    pub hemisphere: Hemisphere,
    /// Name of the canonical surface below `surf/`, without the hemisphere, e.g. `sphere.reg`.
    pub canonsurf: String,
    pub classifier: PathBuf,
    pub output: PathBuf,
}

/// Label subcortical structures of a volume with a classifier, `mri_ca_label`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaLabelSubcortex {
    pub subjects_dir: PathBuf,
    pub input: PathBuf,
    pub transform: PathBuf,
    pub template: PathBuf,
    pub output: PathBuf,
}

/// Per-region surface statistics of an annotation, `mris_anatomical_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnatomicalStats {
    pub subjects_dir: PathBuf,
    pub subject: String,
    pub hemisphere: Hemisphere,
    pub annotation: PathBuf,
    pub thickness: PathBuf,
    pub table: PathBuf,
    pub color_table: PathBuf,
}

/// Per-structure statistics of a segmentation, `mri_segstats`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegStats {
    pub subjects_dir: PathBuf,
    pub segmentation: PathBuf,
    pub color_table: PathBuf,
    pub summary: PathBuf,
}

/// Collect one surface measure of many subjects into a table, `aparcstats2table`.
#[derive(Debug, Clone, PartialEq)]
pub struct AparcStats2Table {
    pub subjects_dir: PathBuf,
    pub subjects: Vec<String>,
    pub scheme: String,
    pub hemisphere: Hemisphere,
    pub measure: SurfaceMeasure,
    pub output: PathBuf,
}


/// A single call of an external tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ApplyTransforms(ApplyTransforms),
    Threshold(Threshold),
    ApplyMask(ApplyMask),
    FitTensor(FitTensor),
    TensorMetrics(TensorMetrics),
    CaLabel(CaLabel),
    CaLabelSubcortex(CaLabelSubcortex),
    AnatomicalStats(AnatomicalStats),
    SegStats(SegStats),
    AparcStats2Table(AparcStats2Table),
}

impl ToolInvocation {
    /// The executable, as configured.
    pub fn program<'a>(&self, tools: &'a ToolsConfig) -> &'a str {
        match self {
            ToolInvocation::ApplyTransforms(_) => &tools.ants_apply_transforms,
            ToolInvocation::Threshold(_) | ToolInvocation::ApplyMask(_) => &tools.fslmaths,
            ToolInvocation::FitTensor(_) => &tools.dwi2tensor,
            ToolInvocation::TensorMetrics(_) => &tools.tensor2metric,
            ToolInvocation::CaLabel(_) => &tools.mris_ca_label,
            ToolInvocation::CaLabelSubcortex(_) => &tools.mri_ca_label,
            ToolInvocation::AnatomicalStats(_) => &tools.mris_anatomical_stats,
            ToolInvocation::SegStats(_) => &tools.mri_segstats,
            ToolInvocation::AparcStats2Table(_) => &tools.aparcstats2table,
        }
    }

    /// The FreeSurfer subjects directory the tool reads from, passed as `SUBJECTS_DIR`.
    pub fn subjects_dir(&self) -> Option<&Path> {
        match self {
            ToolInvocation::CaLabel(t) => Some(t.subjects_dir.as_path()),
            ToolInvocation::CaLabelSubcortex(t) => Some(t.subjects_dir.as_path()),
            ToolInvocation::AnatomicalStats(t) => Some(t.subjects_dir.as_path()),
            ToolInvocation::SegStats(t) => Some(t.subjects_dir.as_path()),
            ToolInvocation::AparcStats2Table(t) => Some(t.subjects_dir.as_path()),
            _ => None,
        }
    }

    /// The command line arguments.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |a: &dyn AsRef<std::ffi::OsStr>| args.push(a.as_ref().to_os_string());
        match self {
            ToolInvocation::ApplyTransforms(t) => {
                push(&"-d");
                push(&"3");
                push(&"-i");
                push(&t.input);
                push(&"-r");
                push(&t.reference);
                push(&"-t");
                push(&t.transform);
                push(&"-o");
                push(&t.output);
                push(&"-n");
                push(&t.interpolation.to_string());
            }
            ToolInvocation::Threshold(t) => {
                push(&t.input);
                push(match t.direction {
                    ThresholdDirection::Below => &"-thr",
                    ThresholdDirection::Above => &"-uthr",
                });
                push(&t.threshold.to_string());
                push(&"-bin");
                push(&t.output);
            }
            ToolInvocation::ApplyMask(m) => {
                push(&m.input);
                push(&"-mas");
                push(&m.mask);
                push(&m.output);
                push(&"-odt");
                push(&m.datatype.to_string());
            }
            ToolInvocation::FitTensor(t) => {
                push(&"-grad");
                push(&t.grad);
                push(&t.dwi);
                push(&t.output);
            }
            ToolInvocation::TensorMetrics(t) => {
                for (metric, path) in &t.outputs {
                    push(&metric.flag());
                    push(path);
                }
                push(&t.tensor);
            }
            ToolInvocation::CaLabel(t) => {
                push(&"-sdir");
                push(&t.subjects_dir);
                push(&"-seed");
                push(&CA_LABEL_SEED.to_string());
                push(&t.subject);
                push(&t.hemisphere.name());
                push(&t.canonsurf);
                push(&t.classifier);
                push(&t.output);
            }
            ToolInvocation::CaLabelSubcortex(t) => {
                push(&t.input);
                push(&t.transform);
                push(&t.template);
                push(&t.output);
            }
            ToolInvocation::AnatomicalStats(t) => {
                push(&"-a");
                push(&t.annotation);
                push(&"-c");
                push(&t.color_table);
                push(&"-f");
                push(&t.table);
                push(&"-t");
                push(&t.thickness);
                push(&"-b");
                push(&t.subject);
                push(&t.hemisphere.name());
                push(&"white");
            }
            ToolInvocation::SegStats(t) => {
                push(&"--seg");
                push(&t.segmentation);
                push(&"--sum");
                push(&t.summary);
                push(&"--ctab");
                push(&t.color_table);
                push(&"--excludeid");
                push(&"0");
            }
            ToolInvocation::AparcStats2Table(t) => {
                push(&"--subjects");
                for subject in &t.subjects {
                    push(subject);
                }
                push(&format!("--parc={}", t.scheme));
                push(&format!("--hemi={}", t.hemisphere));
                push(&format!("--measure={}", t.measure));
                push(&format!("--tablefile={}", t.output.display()));
            }
        }
        args
    }

    /// The files the invocation produces.
    pub fn outputs(&self) -> Vec<PathBuf> {
        match self {
            ToolInvocation::ApplyTransforms(t) => vec![t.output.clone()],
            ToolInvocation::Threshold(t) => vec![t.output.clone()],
            ToolInvocation::ApplyMask(m) => vec![m.output.clone()],
            ToolInvocation::FitTensor(t) => vec![t.output.clone()],
            ToolInvocation::TensorMetrics(t) => t.outputs.iter().map(|(_, p)| p.clone()).collect(),
            ToolInvocation::CaLabel(t) => vec![t.output.clone()],
            ToolInvocation::CaLabelSubcortex(t) => vec![t.output.clone()],
            ToolInvocation::AnatomicalStats(t) => vec![t.table.clone(), t.color_table.clone()],
            ToolInvocation::SegStats(t) => vec![t.summary.clone()],
            ToolInvocation::AparcStats2Table(t) => vec![t.output.clone()],
        }
    }
}


/// Executes tool invocations. Implementations must be usable from several worker threads.
pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &ToolInvocation) -> Result<()>;
}


/// Runs tools as subprocesses, killing them when they exceed the configured timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    tools: ToolsConfig,
    span: Span,
}

impl CommandRunner {
    pub fn new(tools: ToolsConfig, span: Span) -> CommandRunner {
        CommandRunner { tools, span }
    }
}

impl ToolRunner for CommandRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        let _entered = self.span.enter();
        let program = invocation.program(&self.tools);
        let args = invocation.args();
        debug!(program = %program, ?args, "running external tool");

        let failure = |reason: String| ParcellationError::ExternalToolFailure(program.to_string(), reason);

        let mut command = Command::new(program);
        command.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = invocation.subjects_dir() {
            command.env("SUBJECTS_DIR", dir);
        }
        let mut child = command.spawn()
            .map_err(|e| failure(format!("could not start: {}", e)))?;

        let status = match self.tools.timeout() {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
                Ok(None) => {
                    child.kill()?;
                    child.wait()?;
                    warn!(program = %program, secs = timeout.as_secs(), "external tool timed out");
                    return Err(ParcellationError::ExternalToolTimeout(program.to_string(), timeout.as_secs()));
                }
            },
            None => child.wait()?,
        };

        if !status.success() {
            return Err(failure(status.to_string()));
        }

        let missing: Vec<String> = invocation.outputs().iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(failure(format!("missing outputs {}", missing.join(", "))));
        }
        Ok(())
    }
}
