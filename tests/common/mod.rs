//! Synthetic derivatives trees and a tool runner that produces tool outputs in-process.

#![allow(dead_code)]

use ndarray::Array3;
use neuroparc::tools::ThresholdDirection;
use neuroparc::{
    read_label_volume, read_volume, write_volume, Affine, AtlasDefinition, AtlasRegistry, LabelVolume,
    ParcellationError, PipelineConfig, Result, ToolInvocation, ToolRunner, Volume,
};
use tracing::Span;

use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SCHEME: &str = "toy";


/// Runs tool invocations with the crate's own volume I/O and records them.
///
/// Registration resamples the template into the reference grid, which makes it an identity
/// transform for the trees built here.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    /// Invocations whose program name contains this string fail.
    pub fail_on: Option<&'static str>,
    /// Invocations whose program name contains this string time out.
    pub time_out_on: Option<&'static str>,
}

impl FakeRunner {
    pub fn new() -> FakeRunner {
        FakeRunner::default()
    }

    pub fn failing_on(tool: &'static str) -> FakeRunner {
        FakeRunner { fail_on: Some(tool), ..FakeRunner::default() }
    }

    pub fn timing_out_on(tool: &'static str) -> FakeRunner {
        FakeRunner { time_out_on: Some(tool), ..FakeRunner::default() }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn num_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn count<F: Fn(&ToolInvocation) -> bool>(&self, pred: F) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}

fn tool_name(inv: &ToolInvocation) -> &'static str {
    match inv {
        ToolInvocation::ApplyTransforms(_) => "antsApplyTransforms",
        ToolInvocation::Threshold(_) | ToolInvocation::ApplyMask(_) => "fslmaths",
        ToolInvocation::FitTensor(_) => "dwi2tensor",
        ToolInvocation::TensorMetrics(_) => "tensor2metric",
        ToolInvocation::CaLabel(_) => "mris_ca_label",
        ToolInvocation::CaLabelSubcortex(_) => "mri_ca_label",
        ToolInvocation::AnatomicalStats(_) => "mris_anatomical_stats",
        ToolInvocation::SegStats(_) => "mri_segstats",
        ToolInvocation::AparcStats2Table(_) => "aparcstats2table",
    }
}

impl ToolRunner for FakeRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        self.calls.lock().unwrap().push(invocation.clone());
        let name = tool_name(invocation);
        if let Some(fail) = self.fail_on {
            if name.contains(fail) {
                return Err(ParcellationError::ExternalToolFailure(name.to_string(), "exit status: 1".to_string()));
            }
        }
        if let Some(slow) = self.time_out_on {
            if name.contains(slow) {
                return Err(ParcellationError::ExternalToolTimeout(name.to_string(), 1));
            }
        }

        match invocation {
            ToolInvocation::ApplyTransforms(t) => {
                let template = read_label_volume(&t.input)?;
                let reference = read_volume(&t.reference)?;
                let native = template.resample_nearest(reference.spatial_shape(), &reference.affine)?;
                write_volume(&native.to_volume(), &t.output)
            }
            ToolInvocation::Threshold(t) => {
                let probseg = read_volume(&t.input)?;
                let thr = t.threshold;
                let mask = probseg.data.mapv(|v| {
                    let keep = match t.direction {
                        ThresholdDirection::Below => v >= thr,
                        ThresholdDirection::Above => v <= thr,
                    };
                    if keep && v != 0.0 { 1.0 } else { 0.0 }
                });
                write_volume(&Volume::new(mask, probseg.affine), &t.output)
            }
            ToolInvocation::ApplyMask(m) => {
                let atlas = read_volume(&m.input)?;
                let mask = read_volume(&m.mask)?;
                let masked = &atlas.data * &mask.data;
                write_volume(&Volume::new(masked, atlas.affine), &m.output)
            }
            ToolInvocation::FitTensor(t) => {
                File::create(&t.output)?;
                Ok(())
            }
            ToolInvocation::TensorMetrics(t) => {
                for (i, (_, path)) in t.outputs.iter().enumerate() {
                    let value = (i + 1) as f32;
                    write_volume(&Volume::from_3d(Array3::from_elem((3, 3, 3), value), Affine::identity()), path)?;
                }
                Ok(())
            }
            // FreeSurfer outputs are only checked for existence
            other => {
                for output in other.outputs() {
                    touch(&output);
                }
                Ok(())
            }
        }
    }
}


fn touch(path: &Path) {
    create_dir_all(path.parent().unwrap()).unwrap();
    File::create(path).unwrap();
}

fn write(volume: &Volume, path: &Path) {
    create_dir_all(path.parent().unwrap()).unwrap();
    write_volume(volume, path).unwrap();
}

fn grid<F: Fn(usize) -> f32>(f: F) -> Volume {
    Volume::from_3d(Array3::from_shape_fn((3, 3, 3), |(i, _, _)| f(i)), Affine::identity())
}


/// A 3x3x3 atlas with label 1 ("A") at x == 0, label 2 ("B") at x == 1 and background at x == 2.
pub fn toy_atlas(dir: &Path) -> AtlasRegistry {
    let image = dir.join("tpl-MNI_desc-toy_atlas.nii.gz");
    let labels = Array3::from_shape_fn((3, 3, 3), |(i, _, _)| if i < 2 { i as i32 + 1 } else { 0 });
    write(&LabelVolume::new(labels, Affine::identity()).to_volume(), &image);

    let config = neuroparc::AtlasConfig {
        image,
        labels: PathBuf::from("resources/atlases/toy_labels.csv"),
        label_column: "Label".to_string(),
        name_column: None,
        auxiliary: freesurfer_templates(dir),
    };
    let mut registry = AtlasRegistry::new();
    registry.insert(AtlasDefinition::load(SCHEME, &config).unwrap());
    registry
}


/// FreeSurfer classifiers and color table of the toy atlas. The files are never read.
pub fn freesurfer_templates(dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut aux = BTreeMap::new();
    aux.insert("gcs".to_string(), dir.join("{hemi}.toy.gcs"));
    aux.insert("gcs_subcortex".to_string(), dir.join("toy_subcortex.gca"));
    aux.insert("ctab".to_string(), dir.join("toy_LUT.txt"));
    aux
}


/// A FreeSurfer subject with the surfaces and volumes the surface-based parcellation reads.
pub fn add_freesurfer_subject(subjects_dir: &Path, subject: &str) {
    let sub_dir = subjects_dir.join(format!("sub-{}", subject));
    for hemi in &["lh", "rh"] {
        touch(&sub_dir.join("surf").join(format!("{}.sphere.reg", hemi)));
        touch(&sub_dir.join("surf").join(format!("{}.thickness", hemi)));
    }
    touch(&sub_dir.join("mri/brain.mgz"));
    touch(&sub_dir.join("mri/transforms/talairach.m3z"));
}


/// What to create for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionFiles {
    pub transform: bool,
    pub gm_probability: bool,
    pub metrics: bool,
}

impl Default for SessionFiles {
    fn default() -> SessionFiles {
        SessionFiles { transform: true, gm_probability: true, metrics: true }
    }
}


/// Create the anatomical derivatives of a session in `anat_dir`, with file names starting with `prefix`.
///
/// The GM probability is high at x == 0 only, so that cropping removes region "B".
pub fn add_anatomy(anat_dir: &Path, prefix: &str, files: SessionFiles) {
    write(&grid(|_| 100.0), &anat_dir.join(format!("{}_desc-preproc_T1w.nii.gz", prefix)));
    if files.transform {
        touch(&anat_dir.join(format!("{}_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.h5", prefix)));
    }
    if files.gm_probability {
        write(&grid(|i| if i == 0 { 0.9 } else { 0.005 }), &anat_dir.join(format!("{}_label-GM_probseg.nii.gz", prefix)));
    }
}


/// Create the metric images of a session: `fa` is 0.1 * (x + 1) and `adc` is 10 * (x + 1).
pub fn add_metrics(session_dir: &Path, prefix: &str) {
    let dwi = session_dir.join("dwi");
    write(&grid(|i| 0.1 * (i as f32 + 1.0)), &dwi.join(format!("{}_space-T1w_desc-fa_epiref.nii.gz", prefix)));
    write(&grid(|i| 10.0 * (i as f32 + 1.0)), &dwi.join(format!("{}_space-T1w_desc-adc_epiref.nii.gz", prefix)));
}


/// A session-less subject with its anatomy and metrics in the subject directory.
pub fn add_flat_subject(root: &Path, subject: &str, files: SessionFiles) {
    let sub_dir = root.join(format!("sub-{}", subject));
    let prefix = format!("sub-{}", subject);
    add_anatomy(&sub_dir.join("anat"), &prefix, files);
    if files.metrics {
        add_metrics(&sub_dir, &prefix);
    }
}


/// A subject with several sessions and subject-level anatomy.
pub fn add_longitudinal_subject(root: &Path, subject: &str, sessions: &[&str]) {
    let sub_dir = root.join(format!("sub-{}", subject));
    add_anatomy(&sub_dir.join("anat"), &format!("sub-{}", subject), SessionFiles::default());
    for ses in sessions {
        add_metrics(&sub_dir.join(format!("ses-{}", ses)), &format!("sub-{}_ses-{}", subject, ses));
    }
}


pub fn toy_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(root);
    config.metrics = vec!["fa".to_string(), "adc".to_string()];
    config
}


pub fn quiet() -> Span {
    Span::none()
}
