//! BIDS-like derivative file names and path templates.

use std::fmt;


/// A derivative file name, built from its entities.
///
/// Entities are rendered in the order `sub`, `ses`, `space`, `atlas`, `label`, `desc`, `meas`,
/// followed by the suffix and the extension. Unset entities are left out.
///
/// # Examples
///
/// ```
/// use neuroparc::DerivativeName;
/// let name = DerivativeName::new("01", ".nii.gz")
///     .session("baseline")
///     .space("anat")
///     .desc("brainnetome")
///     .suffix("atlas");
/// assert_eq!("sub-01_ses-baseline_space-anat_desc-brainnetome_atlas.nii.gz", name.to_string());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivativeName {
    pub subject: String,
    pub session: Option<String>,
    pub space: Option<String>,
    pub atlas: Option<String>,
    pub label: Option<String>,
    pub desc: Option<String>,
    pub meas: Option<String>,
    pub suffix: Option<String>,
    /// Includes the leading dot, e.g. `.nii.gz`.
    pub extension: String,
}

impl DerivativeName {
    pub fn new<S: Into<String>, E: Into<String>>(subject: S, extension: E) -> DerivativeName {
        DerivativeName { subject: subject.into(), extension: extension.into(), ..Default::default() }
    }

    pub fn session<S: Into<String>>(mut self, session: S) -> DerivativeName {
        self.session = Some(session.into());
        self
    }

    /// Set the session if there is one.
    pub fn maybe_session(mut self, session: Option<&str>) -> DerivativeName {
        self.session = session.map(|s| s.to_string());
        self
    }

    pub fn space<S: Into<String>>(mut self, space: S) -> DerivativeName {
        self.space = Some(space.into());
        self
    }

    pub fn atlas<S: Into<String>>(mut self, atlas: S) -> DerivativeName {
        self.atlas = Some(atlas.into());
        self
    }

    pub fn label<S: Into<String>>(mut self, label: S) -> DerivativeName {
        self.label = Some(label.into());
        self
    }

    pub fn desc<S: Into<String>>(mut self, desc: S) -> DerivativeName {
        self.desc = Some(desc.into());
        self
    }

    pub fn meas<S: Into<String>>(mut self, meas: S) -> DerivativeName {
        self.meas = Some(meas.into());
        self
    }

    pub fn suffix<S: Into<String>>(mut self, suffix: S) -> DerivativeName {
        self.suffix = Some(suffix.into());
        self
    }

    /// The `sub-<id>[_ses-<id>]` part that all files of a session start with.
    pub fn prefix(&self) -> String {
        session_prefix(&self.subject, self.session.as_deref())
    }
}

impl fmt::Display for DerivativeName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.prefix())?;
        let entities = [
            ("space", &self.space),
            ("atlas", &self.atlas),
            ("label", &self.label),
            ("desc", &self.desc),
            ("meas", &self.meas),
        ];
        for (key, value) in entities.iter() {
            if let Some(v) = value {
                write!(f, "_{}-{}", key, v)?;
            }
        }
        if let Some(suffix) = &self.suffix {
            write!(f, "_{}", suffix)?;
        }
        write!(f, "{}", self.extension)
    }
}


/// The `sub-<id>[_ses-<id>]` prefix of the files of a subject or session.
pub fn session_prefix(subject: &str, session: Option<&str>) -> String {
    match session {
        Some(ses) => format!("sub-{}_ses-{}", subject, ses),
        None => format!("sub-{}", subject),
    }
}


/// Fill in the placeholders `{prefix}`, `{subject}`, `{session}` and `{metric}` of a path template.
///
/// Without a session, `{session}` renders empty. Without a metric, `{metric}` is kept as is.
pub fn render_template(template: &str, subject: &str, session: Option<&str>, metric: Option<&str>) -> String {
    let mut rendered = template
        .replace("{prefix}", &session_prefix(subject, session))
        .replace("{subject}", subject)
        .replace("{session}", session.unwrap_or(""));
    if let Some(m) = metric {
        rendered = rendered.replace("{metric}", m);
    }
    rendered
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entities_are_rendered_in_canonical_order() {
        // set in scrambled order on purpose
        let name = DerivativeName::new("01", ".csv")
            .meas("mean")
            .desc("TensorMetrics")
            .label("GM")
            .atlas("brainnetome")
            .space("anat")
            .session("1");
        assert_eq!("sub-01_ses-1_space-anat_atlas-brainnetome_label-GM_desc-TensorMetrics_meas-mean.csv", name.to_string());
    }

    #[test]
    fn session_less_names_have_no_ses_entity() {
        let name = DerivativeName::new("01", ".nii.gz").space("anat").label("GM").desc("brainnetome").suffix("atlas");
        assert_eq!("sub-01_space-anat_label-GM_desc-brainnetome_atlas.nii.gz", name.to_string());
        assert_eq!("sub-01", name.prefix());
    }

    #[test]
    fn templates_are_rendered() {
        let t = "dwi/{prefix}_space-T1w_desc-{metric}_epiref.nii.gz";
        assert_eq!("dwi/sub-01_ses-2_space-T1w_desc-fa_epiref.nii.gz", render_template(t, "01", Some("2"), Some("fa")));
        assert_eq!("dwi/sub-01_space-T1w_desc-{metric}_epiref.nii.gz", render_template(t, "01", None, None));
        assert_eq!("ses-/sub-01", render_template("ses-{session}/sub-{subject}", "01", None, None));
    }
}
