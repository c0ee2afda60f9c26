//! Parcellation of subject-native neuroimaging derivatives.
//!
//! Brain atlases defined in standard space are registered into each subject's anatomical space,
//! optionally cropped to gray matter, and used to average per-voxel metric images (like FA or ADC
//! maps) over the regions of the atlas. The region values of all subjects and sessions end up in
//! a [`ResultTable`], with per-session results cached on disk.
//!
//! Registration, masking and tensor fitting are delegated to external tools (ANTs, FSL, MRtrix3),
//! see [`tools`]. With a FreeSurfer subjects directory, atlases are also mapped onto the cortical
//! surfaces, see [`freesurfer`].

pub mod aggregate;
pub mod atlas;
pub mod cache;
pub mod config;
pub mod error;
pub mod freesurfer;
pub mod label_table;
pub mod logging;
pub mod manifest;
pub mod mgh;
pub mod naming;
pub mod nifti_io;
pub mod pipeline;
pub mod subjects;
pub mod table;
pub mod tools;
pub mod util;
pub mod volume;

pub use aggregate::{aggregate_regions, reduce_region, Aggregation};
pub use atlas::{AtlasDefinition, AtlasRegistry};
pub use cache::CacheGate;
pub use config::{AnalysisSource, AtlasConfig, Config, FileTemplates, PipelineConfig, ToolsConfig};
pub use error::{ParcellationError, Result};
pub use freesurfer::{FreesurferLayout, FreesurferReport, FreesurferSubject, Hemisphere, SurfaceMeasure};
pub use label_table::{read_label_table, LabelTable};
pub use logging::init_run_logging;
pub use manifest::{Manifest, ManifestEntry, Stage};
pub use mgh::{read_mgh, write_mgh, FsMgh, FsMghHeader};
pub use naming::{render_template, DerivativeName};
pub use nifti_io::{read_nifti, write_nifti};
pub use pipeline::{ParcellationPipeline, PipelineReport};
pub use subjects::{AnatomicalInputs, DerivativesLayout, SubjectSessionWalker, SubjectSessions};
pub use table::{read_result_table, ColumnKey, RegionValue, ResultTable, RowKey};
pub use tools::{CommandRunner, ToolInvocation, ToolRunner};
pub use volume::{read_label_volume, read_volume, write_volume, Affine, LabelVolume, Volume};
