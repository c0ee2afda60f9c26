//! Parcellation schemes available to the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::AtlasConfig;
use crate::error::{ParcellationError, Result};
use crate::label_table::LabelTable;


/// A brain atlas in standard space, together with its label table.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasDefinition {
    pub scheme_id: String,
    /// Label volume in MNI space.
    pub template_image: PathBuf,
    pub label_table: LabelTable,
    /// Further named files of the scheme, e.g. the FreeSurfer classifiers of surface-based parcellation.
    pub auxiliary_templates: BTreeMap<String, PathBuf>,
}

impl AtlasDefinition {
    /// Load an atlas definition. The label table is read and the template image must exist.
    pub fn load(scheme_id: &str, config: &AtlasConfig) -> Result<AtlasDefinition> {
        if !config.image.is_file() {
            return Err(ParcellationError::MissingTemplateImage(scheme_id.to_string(), config.image.clone()));
        }
        let label_table = LabelTable::from_file(&config.labels, &config.label_column, config.name_column.as_deref())?;
        if label_table.is_empty() {
            return Err(ParcellationError::InvalidLabelTable(format!("no regions in {}", config.labels.display())));
        }
        Ok(AtlasDefinition {
            scheme_id: scheme_id.to_string(),
            template_image: config.image.clone(),
            label_table,
            auxiliary_templates: config.auxiliary.clone(),
        })
    }

    pub fn auxiliary(&self, name: &str) -> Option<&Path> {
        self.auxiliary_templates.get(name).map(|p| p.as_path())
    }
}

impl fmt::Display for AtlasDefinition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Atlas '{}' with {} regions.", self.scheme_id, self.label_table.len())
    }
}


/// Atlases by scheme id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtlasRegistry {
    atlases: BTreeMap<String, AtlasDefinition>,
}

impl AtlasRegistry {
    pub fn new() -> AtlasRegistry {
        AtlasRegistry::default()
    }

    /// Load all configured atlases.
    pub fn from_config(atlases: &BTreeMap<String, AtlasConfig>) -> Result<AtlasRegistry> {
        let mut registry = AtlasRegistry::new();
        for (scheme, config) in atlases {
            registry.insert(AtlasDefinition::load(scheme, config)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, atlas: AtlasDefinition) {
        self.atlases.insert(atlas.scheme_id.clone(), atlas);
    }

    /// Look up a scheme.
    ///
    /// # Errors
    ///
    /// `UnknownParcellationScheme` if no atlas with that id is registered.
    pub fn get(&self, scheme: &str) -> Result<&AtlasDefinition> {
        self.atlases.get(scheme).ok_or_else(|| ParcellationError::UnknownParcellationScheme(
            scheme.to_string(),
            self.schemes().collect::<Vec<_>>().join(", "),
        ))
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.atlases.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.atlases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atlases.is_empty()
    }
}
