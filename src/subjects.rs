//! Discovery of subjects and sessions, and location of their derivatives.

use glob::Pattern;

use std::path::{Path, PathBuf};

use crate::config::FileTemplates;
use crate::error::{ParcellationError, Result};
use crate::naming::{render_template, session_prefix};


/// A subject and its sessions, without the `sub-` and `ses-` prefixes.
///
/// A subject without session directories has a single `None` session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSessions {
    pub subject: String,
    pub sessions: Vec<Option<String>>,
}

impl SubjectSessions {
    pub fn new<S: Into<String>>(subject: S, sessions: Vec<Option<String>>) -> SubjectSessions {
        let sessions = if sessions.is_empty() { vec![None] } else { sessions };
        SubjectSessions { subject: subject.into(), sessions }
    }

    /// The number of actual sessions. A session-less subject has 0.
    pub fn num_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }
}


/// Lists the `sub-*` directories under a derivatives root, and their `ses-*` directories.
#[derive(Debug, Clone)]
pub struct SubjectSessionWalker {
    root: PathBuf,
}

impl SubjectSessionWalker {
    pub fn new<P: Into<PathBuf>>(root: P) -> SubjectSessionWalker {
        SubjectSessionWalker { root: root.into() }
    }

    /// All subjects with their sessions, sorted by id.
    pub fn walk(&self) -> Result<Vec<SubjectSessions>> {
        let mut subjects = Vec::new();
        for subject in list_prefixed_dirs(&self.root, "sub-")? {
            let sessions = list_prefixed_dirs(&self.root.join(format!("sub-{}", subject)), "ses-")?
                .into_iter()
                .map(Some)
                .collect();
            subjects.push(SubjectSessions::new(subject, sessions));
        }
        Ok(subjects)
    }
}


/// The ids of the directories in `dir` named `<prefix><id>`, sorted.
fn list_prefixed_dirs(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let pattern = format!("{}/{}*", Pattern::escape(&dir.to_string_lossy()), prefix);
    let mut ids = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = match entry {
            Ok(p) => p,
            Err(e) => return Err(ParcellationError::Io(e.into())),
        };
        if !path.is_dir() {
            continue;
        }
        if let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(|n| n.strip_prefix(prefix)) {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}


/// Return the first file in `dir`, in lexicographic order, whose name matches `<prefix>_<pattern>`.
pub fn find_first(dir: &Path, prefix: &str, pattern: &str) -> Result<Option<PathBuf>> {
    let full = format!("{}/{}_{}", Pattern::escape(&dir.to_string_lossy()), Pattern::escape(prefix), pattern);
    let mut matches: Vec<PathBuf> = glob::glob(&full)?.filter_map(|e| e.ok()).filter(|p| p.is_file()).collect();
    matches.sort();
    Ok(matches.into_iter().next())
}


/// The anatomical derivatives needed to bring an atlas into a subject's space.
#[derive(Debug, Clone, PartialEq)]
pub struct AnatomicalInputs {
    /// The directory holding the anatomical derivatives, which also receives the native atlases.
    pub anat_dir: PathBuf,
    /// The session the derivatives belong to. `None` for subject-level derivatives.
    pub session: Option<String>,
    /// `sub-<id>` or `sub-<id>_ses-<id>`, depending on where the derivatives live.
    pub prefix: String,
    pub reference: PathBuf,
    pub mni_to_native: PathBuf,
    /// `None` if no gray matter probability map exists.
    pub gm_probability: Option<PathBuf>,
}


/// The file layout of a derivatives tree.
#[derive(Debug, Clone)]
pub struct DerivativesLayout {
    pub root: PathBuf,
    pub templates: FileTemplates,
    pub longitudinal_sensitive: bool,
}

impl DerivativesLayout {
    pub fn new<P: Into<PathBuf>>(root: P, templates: FileTemplates, longitudinal_sensitive: bool) -> DerivativesLayout {
        DerivativesLayout { root: root.into(), templates, longitudinal_sensitive }
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{}", subject))
    }

    /// The session directory, or the subject directory for session-less subjects.
    pub fn session_dir(&self, subject: &str, session: Option<&str>) -> PathBuf {
        match session {
            Some(ses) => self.subject_dir(subject).join(format!("ses-{}", ses)),
            None => self.subject_dir(subject),
        }
    }

    /// Whether the anatomical derivatives of a session live at the subject level.
    ///
    /// This is the case for subjects with more than one session, and for all subjects of
    /// sources that are not longitudinal-sensitive.
    pub fn anatomy_at_subject_level(&self, session: Option<&str>, num_sessions: usize) -> bool {
        session.is_none() || num_sessions > 1 || !self.longitudinal_sensitive
    }

    /// Locate the anatomical reference, the MNI-to-native transform and the GM probability map of a session.
    ///
    /// # Errors
    ///
    /// `MissingInput` if the reference or the transform is missing.
    pub fn anatomical_inputs(&self, subject: &str, session: Option<&str>, num_sessions: usize) -> Result<AnatomicalInputs> {
        let anat_session = if self.anatomy_at_subject_level(session, num_sessions) { None } else { session };
        let anat_dir = self.session_dir(subject, anat_session).join("anat");
        let prefix = session_prefix(subject, anat_session);

        let require = |what: &str, pattern: &str| -> Result<PathBuf> {
            find_first(&anat_dir, &prefix, pattern)?.ok_or_else(|| ParcellationError::MissingInput(
                subject.to_string(),
                what.to_string(),
                anat_dir.join(format!("{}_{}", prefix, pattern)).display().to_string(),
            ))
        };
        let reference = require("anatomical reference", &self.templates.anatomical_reference)?;
        let mni_to_native = require("MNI-to-native transform", &self.templates.mni_to_native_transform)?;
        let gm_probability = find_first(&anat_dir, &prefix, &self.templates.gm_probability)?;

        Ok(AnatomicalInputs {
            anat_dir,
            session: anat_session.map(|s| s.to_string()),
            prefix,
            reference,
            mni_to_native,
            gm_probability,
        })
    }

    fn session_file(&self, template: &str, subject: &str, session: Option<&str>, metric: Option<&str>) -> PathBuf {
        self.session_dir(subject, session).join(render_template(template, subject, session, metric))
    }

    pub fn metric_path(&self, subject: &str, session: Option<&str>, metric: &str) -> PathBuf {
        self.session_file(&self.templates.metric, subject, session, Some(metric))
    }

    pub fn dwi_path(&self, subject: &str, session: Option<&str>) -> PathBuf {
        self.session_file(&self.templates.dwi, subject, session, None)
    }

    pub fn grad_path(&self, subject: &str, session: Option<&str>) -> PathBuf {
        self.session_file(&self.templates.grad, subject, session, None)
    }

    pub fn tensor_path(&self, subject: &str, session: Option<&str>) -> PathBuf {
        self.session_file(&self.templates.tensor, subject, session, None)
    }

    /// The directory receiving the per-session result tables.
    pub fn results_dir(&self, subject: &str, session: Option<&str>) -> PathBuf {
        self.session_dir(subject, session).join(&self.templates.results_dir)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AnalysisSource;
    use std::fs::{create_dir_all, File};
    use tempfile::tempdir;

    fn touch(path: &Path) {
        create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    #[test]
    fn subjects_and_sessions_are_listed_sorted_without_prefixes() {
        let dir = tempdir().unwrap();
        create_dir_all(dir.path().join("sub-02/ses-b")).unwrap();
        create_dir_all(dir.path().join("sub-02/ses-a")).unwrap();
        create_dir_all(dir.path().join("sub-01/anat")).unwrap();
        touch(&dir.path().join("sub-03.html"));
        create_dir_all(dir.path().join("logs")).unwrap();

        let walked = SubjectSessionWalker::new(dir.path()).walk().unwrap();
        assert_eq!(vec![
            SubjectSessions::new("01", vec![None]),
            SubjectSessions::new("02", vec![Some("a".to_string()), Some("b".to_string())]),
        ], walked);
        assert_eq!(0, walked[0].num_sessions());
        assert_eq!(2, walked[1].num_sessions());
    }

    #[test]
    fn single_session_anatomy_is_resolved_inside_the_session() {
        let dir = tempdir().unwrap();
        let anat = dir.path().join("sub-01/ses-1/anat");
        touch(&anat.join("sub-01_ses-1_desc-preproc_T1w.nii.gz"));
        touch(&anat.join("sub-01_ses-1_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.h5"));

        let layout = DerivativesLayout::new(dir.path(), AnalysisSource::Qsiprep.default_templates(), true);
        let inputs = layout.anatomical_inputs("01", Some("1"), 1).unwrap();
        assert_eq!(anat, inputs.anat_dir);
        assert_eq!("sub-01_ses-1", inputs.prefix);
        assert_eq!(anat.join("sub-01_ses-1_desc-preproc_T1w.nii.gz"), inputs.reference);
        assert!(inputs.gm_probability.is_none());
    }

    #[test]
    fn longitudinal_anatomy_is_resolved_at_the_subject_level() {
        let dir = tempdir().unwrap();
        let anat = dir.path().join("sub-01/anat");
        touch(&anat.join("sub-01_desc-preproc_T1w.nii.gz"));
        touch(&anat.join("sub-01_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.h5"));
        touch(&anat.join("sub-01_label-GM_probseg.nii.gz"));

        let layout = DerivativesLayout::new(dir.path(), AnalysisSource::Qsiprep.default_templates(), true);
        let inputs = layout.anatomical_inputs("01", Some("2"), 2).unwrap();
        assert_eq!(anat, inputs.anat_dir);
        assert_eq!("sub-01", inputs.prefix);
        assert_eq!(None, inputs.session);
        assert_eq!(Some(anat.join("sub-01_label-GM_probseg.nii.gz")), inputs.gm_probability);
    }

    #[test]
    fn a_missing_transform_is_a_missing_input() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("sub-01/anat/sub-01_desc-preproc_T1w.nii.gz"));
        let layout = DerivativesLayout::new(dir.path(), AnalysisSource::Qsiprep.default_templates(), true);
        let result = layout.anatomical_inputs("01", None, 0);
        assert!(matches!(result, Err(ParcellationError::MissingInput(ref s, _, _)) if s == "01"));
    }

    #[test]
    fn metric_paths_are_rendered_relative_to_the_session() {
        let layout = DerivativesLayout::new("/d", AnalysisSource::Qsiprep.default_templates(), true);
        assert_eq!(PathBuf::from("/d/sub-01/ses-1/dwi/sub-01_ses-1_space-T1w_desc-fa_epiref.nii.gz"),
            layout.metric_path("01", Some("1"), "fa"));
        assert_eq!(PathBuf::from("/d/sub-01/dwi"), layout.results_dir("01", None));
    }
}
