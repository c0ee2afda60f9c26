//! Orchestration: registration of atlases into subject space, GM cropping, and parcellation of metric images.
//!
//! Each session moves through the stages of [`Stage`]. Problems with a session, like missing
//! inputs or failing tools, stop that session and are recorded in the [`Manifest`]. They never
//! abort the batch.
//!
//! With a FreeSurfer subjects directory configured, each subject's surfaces are also labeled with
//! the scheme's classifiers and the surface statistics of all subjects are grouped.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, info_span, warn, Span};

use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregate::aggregate_regions;
use crate::atlas::{AtlasDefinition, AtlasRegistry};
use crate::cache::CacheGate;
use crate::config::{Config, PipelineConfig};
use crate::error::{ParcellationError, Result};
use crate::freesurfer::{
    group_table_path, render_hemisphere, FreesurferLayout, FreesurferReport, FreesurferSubject, Hemisphere,
    SurfaceMeasure, AUX_CTAB, AUX_GCS, AUX_GCS_SUBCORTEX,
};
use crate::manifest::{Manifest, ManifestEntry, Stage};
use crate::naming::DerivativeName;
use crate::subjects::{AnatomicalInputs, DerivativesLayout, SubjectSessionWalker, SubjectSessions};
use crate::table::{ResultTable, RowKey};
use crate::tools::{
    AnatomicalStats, AparcStats2Table, ApplyMask, ApplyTransforms, CaLabel, CaLabelSubcortex, CommandRunner,
    FitTensor, Interpolation, OutputDatatype, SegStats, TensorMetric, TensorMetrics, Threshold, ThresholdDirection,
    ToolInvocation, ToolRunner,
};
use crate::volume::{read_label_volume, read_volume};


/// The outputs of a pipeline run for one parcellation scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub scheme: String,
    pub whole_brain: ResultTable,
    /// `None` if GM cropping is disabled.
    pub gm_cropped: Option<ResultTable>,
    pub manifest: Manifest,
    /// `None` if no FreeSurfer subjects directory is configured.
    pub freesurfer: Option<FreesurferReport>,
}

impl PipelineReport {
    /// Write the group tables and the manifest to `dir`, as `<scheme>_whole-brain.csv`,
    /// `<scheme>_label-GM.csv` and `<scheme>_manifest.csv`. Returns the written paths.
    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        let whole_brain = dir.join(format!("{}_whole-brain.csv", self.scheme));
        self.whole_brain.to_file(&whole_brain)?;
        written.push(whole_brain);

        if let Some(gm) = &self.gm_cropped {
            let path = dir.join(format!("{}_label-GM.csv", self.scheme));
            gm.to_file(&path)?;
            written.push(path);
        }

        let manifest = dir.join(format!("{}_manifest.csv", self.scheme));
        self.manifest.to_file(&manifest)?;
        written.push(manifest);
        Ok(written)
    }
}


/// Which native atlas a table is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    WholeBrain,
    GmCropped,
}


/// The outcome of one session. Tables hold the single row of the session.
#[derive(Debug)]
struct SessionOutcome {
    entry: ManifestEntry,
    whole_brain: Option<ResultTable>,
    gm_cropped: Option<ResultTable>,
}


pub struct ParcellationPipeline<R: ToolRunner> {
    config: PipelineConfig,
    atlases: AtlasRegistry,
    layout: DerivativesLayout,
    freesurfer: Option<FreesurferLayout>,
    runner: R,
    cache: CacheGate,
    span: Span,
}


impl ParcellationPipeline<CommandRunner> {
    /// Set up a pipeline running the external tools as subprocesses. The atlases are loaded.
    pub fn from_config(config: &Config, span: Span) -> Result<ParcellationPipeline<CommandRunner>> {
        config.validate()?;
        let atlases = AtlasRegistry::from_config(&config.atlases)?;
        let runner = CommandRunner::new(config.tools.clone(), span.clone());
        Ok(ParcellationPipeline::new(config.pipeline.clone(), atlases, runner, span))
    }
}


impl<R: ToolRunner> ParcellationPipeline<R> {
    pub fn new(config: PipelineConfig, atlases: AtlasRegistry, runner: R, span: Span) -> ParcellationPipeline<R> {
        let layout = DerivativesLayout::new(&config.derivatives_dir, config.templates(), config.longitudinal_sensitive);
        let freesurfer = config.freesurfer_dir.as_ref().map(FreesurferLayout::new);
        let cache = CacheGate::new(span.clone());
        ParcellationPipeline { config, atlases, layout, freesurfer, runner, cache, span }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &DerivativesLayout {
        &self.layout
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Write a report to the configured destination, see [`PipelineReport::write`].
    pub fn write_report(&self, report: &PipelineReport) -> Result<Vec<PathBuf>> {
        report.write(self.config.destination())
    }

    /// Run for all subjects found in the derivatives directory.
    pub fn run_all(&self, scheme: &str) -> Result<PipelineReport> {
        self.atlases.get(scheme)?;
        let subjects = SubjectSessionWalker::new(&self.config.derivatives_dir).walk()?;
        self.run(scheme, &subjects)
    }

    /// Run for the given subjects.
    ///
    /// # Errors
    ///
    /// Only setup problems, like an unknown scheme, are errors. Failures of single sessions are
    /// recorded in the manifest of the report.
    pub fn run(&self, scheme: &str, subjects: &[SubjectSessions]) -> Result<PipelineReport> {
        let atlas = self.atlases.get(scheme)?;
        if self.freesurfer.is_some() && atlas.auxiliary(AUX_GCS).is_none() {
            return Err(ParcellationError::InvalidConfig(format!(
                "atlas '{}' has no '{}' classifier, which FreeSurfer parcellation needs", scheme, AUX_GCS)));
        }
        let _entered = self.span.enter();
        info!(scheme = %scheme, subjects = subjects.len(), jobs = self.config.jobs, "starting parcellation");

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .build()
            .map_err(|e| ParcellationError::InvalidConfig(format!("cannot start {} workers: {}", self.config.jobs, e)))?;
        let outcomes: Vec<(Vec<SessionOutcome>, Option<FreesurferSubject>)> = pool.install(|| {
            subjects.par_iter().map(|s| self.process_subject(atlas, s)).collect()
        });

        let regions = atlas.label_table.regions();
        let mut whole_brain = vec![ResultTable::from_product(regions, &self.config.metrics)];
        let mut gm_cropped = vec![ResultTable::from_product(regions, &self.config.metrics)];
        let mut entries = Vec::new();
        let mut surface_subjects = Vec::new();
        for (sessions, surface) in outcomes {
            for outcome in sessions {
                whole_brain.extend(outcome.whole_brain);
                gm_cropped.extend(outcome.gm_cropped);
                entries.push(outcome.entry);
            }
            surface_subjects.extend(surface);
        }
        let manifest = Manifest::new(entries);
        info!(scheme = %scheme, sessions = manifest.len(), failed = manifest.failures().count(), "parcellation finished");

        let freesurfer = match &self.freesurfer {
            Some(surfaces) => Some(self.group_freesurfer(atlas, surfaces, surface_subjects)),
            None => None,
        };

        Ok(PipelineReport {
            scheme: scheme.to_string(),
            whole_brain: ResultTable::concat(&whole_brain),
            gm_cropped: if self.config.crop_to_gm { Some(ResultTable::concat(&gm_cropped)) } else { None },
            manifest,
            freesurfer,
        })
    }

    fn process_subject(&self, atlas: &AtlasDefinition, subject: &SubjectSessions) -> (Vec<SessionOutcome>, Option<FreesurferSubject>) {
        let num_sessions = subject.num_sessions();
        let sessions = subject.sessions.iter()
            .map(|session| self.process_session(atlas, &subject.subject, session.as_deref(), num_sessions))
            .collect();
        let surface = self.freesurfer.as_ref().map(|surfaces| self.process_freesurfer_subject(atlas, surfaces, &subject.subject));
        (sessions, surface)
    }

    fn process_session(&self, atlas: &AtlasDefinition, subject: &str, session: Option<&str>, num_sessions: usize) -> SessionOutcome {
        let span = info_span!(parent: &self.span, "session", subject = %subject, session = session.unwrap_or(""));
        let _entered = span.enter();

        let mut outcome = SessionOutcome {
            entry: ManifestEntry::new(subject, session),
            whole_brain: None,
            gm_cropped: None,
        };
        if let Err(e) = self.advance(atlas, subject, session, num_sessions, &mut outcome) {
            warn!(stage = %outcome.entry.stage, "{}", e);
            outcome.entry.failure = Some(e.to_string());
        }
        outcome
    }

    /// Walk a session through the stages. Progress is recorded in `outcome`, so that it can be reported on failure.
    fn advance(&self, atlas: &AtlasDefinition, subject: &str, session: Option<&str>, num_sessions: usize, outcome: &mut SessionOutcome) -> Result<()> {
        let inputs = self.layout.anatomical_inputs(subject, session, num_sessions)?;

        let whole_brain = self.register(atlas, subject, &inputs)?;
        outcome.entry.stage = Stage::RegisteredWholeBrain;

        let gm_cropped = if self.config.crop_to_gm { self.crop_to_gm(atlas, subject, &inputs, &whole_brain)? } else { None };
        if gm_cropped.is_some() {
            outcome.entry.stage = Stage::RegisteredGmCropped;
        }

        if self.config.estimate_tensors {
            self.estimate_tensors(subject, session)?;
        }

        outcome.whole_brain = Some(self.parcellate(atlas, subject, session, &whole_brain, Variant::WholeBrain)?);
        outcome.entry.whole_brain = true;
        if let Some(gm) = &gm_cropped {
            outcome.gm_cropped = Some(self.parcellate(atlas, subject, session, gm, Variant::GmCropped)?);
            outcome.entry.gm_cropped = true;
        }
        outcome.entry.stage = Stage::Parcellated;
        Ok(())
    }

    fn native_name(subject: &str, inputs: &AnatomicalInputs) -> DerivativeName {
        DerivativeName::new(subject, ".nii.gz").maybe_session(inputs.session.as_deref())
    }

    /// Bring the atlas into the anatomical space of a session. Returns the native atlas.
    fn register(&self, atlas: &AtlasDefinition, subject: &str, inputs: &AnatomicalInputs) -> Result<PathBuf> {
        let whole_brain = inputs.anat_dir.join(
            Self::native_name(subject, inputs).space("anat").desc(&atlas.scheme_id).suffix("atlas").to_string());
        if self.cache.should_run("register", &[&whole_brain], self.config.force) {
            info!(scheme = %atlas.scheme_id, "transforming atlas from standard to individual space");
            self.runner.run(&ToolInvocation::ApplyTransforms(ApplyTransforms {
                input: atlas.template_image.clone(),
                reference: inputs.reference.clone(),
                transform: inputs.mni_to_native.clone(),
                output: whole_brain.clone(),
                interpolation: Interpolation::NearestNeighbor,
            }))?;
        }
        Ok(whole_brain)
    }

    /// Crop a native atlas to the thresholded gray matter probability map. Returns `None` if there is no map.
    fn crop_to_gm(&self, atlas: &AtlasDefinition, subject: &str, inputs: &AnatomicalInputs, whole_brain: &Path) -> Result<Option<PathBuf>> {
        let probseg = match &inputs.gm_probability {
            Some(p) => p,
            None => {
                warn!("no gray matter probability map, skipping GM cropping");
                return Ok(None);
            }
        };

        let mask = inputs.anat_dir.join(Self::native_name(subject, inputs).label("GM").suffix("mask").to_string());
        let cropped = inputs.anat_dir.join(
            Self::native_name(subject, inputs).space("anat").label("GM").desc(&atlas.scheme_id).suffix("atlas").to_string());
        if self.cache.should_run("crop", &[&mask, &cropped], self.config.force) {
            info!(scheme = %atlas.scheme_id, threshold = self.config.probseg_threshold, "cropping atlas to gray matter");
            self.runner.run(&ToolInvocation::Threshold(Threshold {
                input: probseg.clone(),
                threshold: self.config.probseg_threshold,
                direction: ThresholdDirection::Below,
                output: mask.clone(),
            }))?;
            self.runner.run(&ToolInvocation::ApplyMask(ApplyMask {
                input: whole_brain.to_path_buf(),
                mask,
                output: cropped.clone(),
                datatype: OutputDatatype::Int,
            }))?;
        }
        Ok(Some(cropped))
    }

    /// Fit tensors to the preprocessed DWI of a session and derive the configured tensor metrics.
    fn estimate_tensors(&self, subject: &str, session: Option<&str>) -> Result<()> {
        let dwi = self.layout.dwi_path(subject, session);
        let grad = self.layout.grad_path(subject, session);
        let tensor = self.layout.tensor_path(subject, session);
        for (what, path) in [("preprocessed DWI", &dwi), ("gradient table", &grad)].iter() {
            if !path.exists() {
                return Err(ParcellationError::MissingInput(subject.to_string(), what.to_string(), path.display().to_string()));
            }
        }

        if self.cache.should_run("dwi2tensor", &[&tensor], self.config.force) {
            info!("estimating diffusion tensors");
            self.runner.run(&ToolInvocation::FitTensor(FitTensor {
                dwi: dwi.clone(),
                grad: grad.clone(),
                output: tensor.clone(),
            }))?;
        }

        let outputs: Vec<(TensorMetric, PathBuf)> = self.config.metrics.iter()
            .filter_map(|m| TensorMetric::from_name(m))
            .map(|m| (m, self.layout.metric_path(subject, session, m.name())))
            .collect();
        let paths: Vec<&PathBuf> = outputs.iter().map(|(_, p)| p).collect();
        if !outputs.is_empty() && self.cache.should_run("tensor2metric", &paths, self.config.force) {
            info!(metrics = outputs.len(), "deriving tensor metrics");
            self.runner.run(&ToolInvocation::TensorMetrics(TensorMetrics { tensor, outputs }))?;
        }
        Ok(())
    }

    fn process_freesurfer_subject(&self, atlas: &AtlasDefinition, surfaces: &FreesurferLayout, subject: &str) -> FreesurferSubject {
        let span = info_span!(parent: &self.span, "freesurfer", subject = %subject);
        let _entered = span.enter();

        let mut outcome = FreesurferSubject::new(subject);
        if let Err(e) = self.label_surfaces(atlas, surfaces, subject, &mut outcome) {
            warn!("{}", e);
            outcome.failure = Some(e.to_string());
        }
        outcome
    }

    /// Label both hemispheres and the subcortex of a FreeSurfer subject and compute region statistics.
    fn label_surfaces(&self, atlas: &AtlasDefinition, surfaces: &FreesurferLayout, subject: &str, outcome: &mut FreesurferSubject) -> Result<()> {
        let scheme = atlas.scheme_id.as_str();
        let gcs = atlas.auxiliary(AUX_GCS).ok_or_else(|| ParcellationError::MissingInput(
            subject.to_string(), format!("'{}' classifier of atlas {}", AUX_GCS, scheme), "auxiliary templates".to_string()))?;
        let fs_subject = surfaces.subject_id(subject);
        let force = self.config.force;

        for hemi in Hemisphere::ALL.iter().copied() {
            let sphere = surfaces.sphere_reg(subject, hemi);
            require(subject, &format!("{} spherical registration", hemi), &sphere)?;

            let annotation = surfaces.annotation(subject, hemi, scheme);
            if self.cache.should_run("mris_ca_label", &[&annotation], force) {
                info!(hemi = %hemi, "labeling cortical surface");
                self.runner.run(&ToolInvocation::CaLabel(CaLabel {
                    subjects_dir: surfaces.subjects_dir().to_path_buf(),
                    subject: fs_subject.clone(),
                    hemisphere: hemi,
                    canonsurf: "sphere.reg".to_string(),
                    classifier: render_hemisphere(gcs, hemi),
                    output: annotation.clone(),
                }))?;
            }

            let table = surfaces.stats(subject, hemi, scheme);
            let color_table = surfaces.color_table(subject, scheme);
            if self.cache.should_run("mris_anatomical_stats", &[&table, &color_table], force) {
                info!(hemi = %hemi, "computing surface statistics");
                self.runner.run(&ToolInvocation::AnatomicalStats(AnatomicalStats {
                    subjects_dir: surfaces.subjects_dir().to_path_buf(),
                    subject: fs_subject.clone(),
                    hemisphere: hemi,
                    annotation,
                    thickness: surfaces.thickness(subject, hemi),
                    table: table.clone(),
                    color_table,
                }))?;
            }
            outcome.stats.push(table);
        }

        let (gca, ctab) = match (atlas.auxiliary(AUX_GCS_SUBCORTEX), atlas.auxiliary(AUX_CTAB)) {
            (Some(gca), Some(ctab)) => (gca, ctab),
            _ => {
                debug!(scheme = %scheme, "no subcortical classifier and color table, skipping subcortex");
                return Ok(());
            }
        };
        let brain = surfaces.brain(subject);
        let transform = surfaces.talairach(subject);
        require(subject, "skull-stripped brain", &brain)?;
        require(subject, "talairach transform", &transform)?;

        let labeled = surfaces.subcortex(subject, scheme);
        if self.cache.should_run("mri_ca_label", &[&labeled], force) {
            info!("labeling subcortex");
            self.runner.run(&ToolInvocation::CaLabelSubcortex(CaLabelSubcortex {
                subjects_dir: surfaces.subjects_dir().to_path_buf(),
                input: brain,
                transform,
                template: gca.to_path_buf(),
                output: labeled.clone(),
            }))?;
        }
        let summary = surfaces.subcortex_stats(subject, scheme);
        if self.cache.should_run("mri_segstats", &[&summary], force) {
            info!("computing subcortical statistics");
            self.runner.run(&ToolInvocation::SegStats(SegStats {
                subjects_dir: surfaces.subjects_dir().to_path_buf(),
                segmentation: labeled,
                color_table: ctab.to_path_buf(),
                summary: summary.clone(),
            }))?;
        }
        outcome.subcortex_stats = Some(summary);
        Ok(())
    }

    /// Collect the surface statistics of all subjects without failures into group tables.
    ///
    /// Group tables depend on the set of subjects, so they are rebuilt on every run.
    fn group_freesurfer(&self, atlas: &AtlasDefinition, surfaces: &FreesurferLayout, subjects: Vec<FreesurferSubject>) -> FreesurferReport {
        let mut report = FreesurferReport { subjects, ..FreesurferReport::default() };
        let grouped: Vec<String> = report.subjects.iter()
            .filter(|s| !s.is_failed())
            .map(|s| surfaces.subject_id(&s.subject))
            .collect();
        if grouped.is_empty() {
            warn!(scheme = %atlas.scheme_id, "no FreeSurfer subjects to group");
            return report;
        }

        let dir = self.config.destination().join("freesurfer");
        let result = fs::create_dir_all(&dir).map_err(ParcellationError::from).and_then(|_| {
            for hemi in Hemisphere::ALL.iter().copied() {
                for measure in SurfaceMeasure::ALL.iter().copied() {
                    let output = group_table_path(&dir, hemi, &atlas.scheme_id, measure);
                    self.runner.run(&ToolInvocation::AparcStats2Table(AparcStats2Table {
                        subjects_dir: surfaces.subjects_dir().to_path_buf(),
                        subjects: grouped.clone(),
                        scheme: atlas.scheme_id.clone(),
                        hemisphere: hemi,
                        measure,
                        output: output.clone(),
                    }))?;
                    report.group_tables.push(output);
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(scheme = %atlas.scheme_id, "grouping FreeSurfer statistics failed: {}", e);
            report.group_failure = Some(e.to_string());
        } else {
            info!(scheme = %atlas.scheme_id, subjects = grouped.len(), tables = report.group_tables.len(), "FreeSurfer statistics grouped");
        }
        report
    }

    /// The per-session result table of a variant.
    pub fn session_table_path(&self, scheme: &str, subject: &str, session: Option<&str>, gm_cropped: bool) -> PathBuf {
        let mut name = DerivativeName::new(subject, ".csv")
            .maybe_session(session)
            .space("anat")
            .atlas(scheme);
        if gm_cropped {
            name = name.label("GM");
        }
        let name = name.desc(&self.config.results_desc).meas(self.config.aggregation.measure_name());
        self.layout.results_dir(subject, session).join(name.to_string())
    }

    /// Compute, or read back, the region values of all metrics of a session.
    fn parcellate(&self, atlas: &AtlasDefinition, subject: &str, session: Option<&str>, native_atlas: &Path, variant: Variant) -> Result<ResultTable> {
        let table_path = self.session_table_path(&atlas.scheme_id, subject, session, variant == Variant::GmCropped);
        if !self.cache.should_run("parcellate", &[&table_path], self.config.force) {
            return ResultTable::from_file(&table_path);
        }

        info!(?variant, "parcellating metric images");
        let labels = read_label_volume(native_atlas)?;
        let regions = atlas.label_table.regions();
        let metrics = &self.config.metrics;
        let mut values = vec![f64::NAN; regions.len() * metrics.len()];
        for (m, metric) in metrics.iter().enumerate() {
            let path = self.layout.metric_path(subject, session, metric);
            if !path.is_file() {
                return Err(ParcellationError::MissingInput(
                    subject.to_string(), format!("{} image", metric), path.display().to_string()));
            }
            let image = read_volume(&path)?;
            let region_values = aggregate_regions(&labels, &atlas.label_table, &image, self.config.aggregation)?;
            for (r, v) in region_values.into_iter().enumerate() {
                values[r * metrics.len() + m] = v;
            }
        }

        let mut table = ResultTable::from_product(regions, metrics);
        table.push_row(RowKey::new(subject, session), values)?;
        fs::create_dir_all(self.layout.results_dir(subject, session))?;
        table.to_file(&table_path)?;
        Ok(table)
    }
}


fn require(subject: &str, what: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(ParcellationError::MissingInput(subject.to_string(), what.to_string(), path.display().to_string()))
    }
}
