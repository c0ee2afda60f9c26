//! Brain volumes on a voxel grid, with their voxel-to-world transform.
//!
//! Volumes are stored as 4D arrays with axis order (x, y, z, frame). A 3D image simply has
//! a single frame. Label volumes (atlases, segmentations) are kept separately as 3D integer
//! arrays, see [`LabelVolume`].

use approx::AbsDiffEq;
use ndarray::{Array3, Array4, Axis};

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{ParcellationError, Result};
use crate::mgh::{read_mgh, write_mgh};
use crate::nifti_io::{read_nifti, write_nifti};
use crate::util::full_extension;


/// A 4x4 homogeneous voxel-to-world (RAS) transform, stored row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Affine {
        Affine::identity()
    }
}

impl Affine {
    pub fn identity() -> Affine {
        Affine::from_diagonal([1.0, 1.0, 1.0], [0.0, 0.0, 0.0])
    }

    /// An axis-aligned transform with the given voxel sizes and origin.
    pub fn from_diagonal(voxel_size: [f64; 3], origin: [f64; 3]) -> Affine {
        let mut m = [[0.0; 4]; 4];
        for i in 0..3 {
            m[i][i] = voxel_size[i];
            m[i][3] = origin[i];
        }
        m[3][3] = 1.0;
        Affine(m)
    }

    /// Apply the transform to a point.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        let mut out = [0.0; 3];
        for (i, o) in out.iter_mut().enumerate() {
            *o = m[i][0] * p[0] + m[i][1] * p[1] + m[i][2] * p[2] + m[i][3];
        }
        out
    }

    /// Matrix product `self * other`, i.e., `other` is applied first.
    pub fn compose(&self, other: &Affine) -> Affine {
        let mut m = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                m[i][j] = (0..4).map(|k| self.0[i][k] * other.0[k][j]).sum();
            }
        }
        Affine(m)
    }

    /// Invert the transform. Returns `None` if the linear part is singular.
    pub fn inverse(&self) -> Option<Affine> {
        let m = &self.0;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let mut inv = [[0.0; 4]; 4];
        inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det;
        inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det;
        inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det;
        inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det;
        inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det;
        inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det;
        inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det;
        inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det;
        inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det;
        for i in 0..3 {
            inv[i][3] = -(inv[i][0] * m[0][3] + inv[i][1] * m[1][3] + inv[i][2] * m[2][3]);
        }
        inv[3][3] = 1.0;
        Some(Affine(inv))
    }

    /// The length of each voxel axis in world units.
    pub fn voxel_sizes(&self) -> [f64; 3] {
        let m = &self.0;
        let mut sizes = [0.0; 3];
        for (j, s) in sizes.iter_mut().enumerate() {
            *s = (m[0][j] * m[0][j] + m[1][j] * m[1][j] + m[2][j] * m[2][j]).sqrt();
        }
        sizes
    }
}

impl AbsDiffEq for Affine {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Affine, epsilon: f64) -> bool {
        self.0.iter().flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| a.abs_diff_eq(b, epsilon))
    }
}


/// A scalar (or multi-frame) image on a voxel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array4<f32>,
    pub affine: Affine,
}

impl Volume {
    pub fn new(data: Array4<f32>, affine: Affine) -> Volume {
        Volume { data, affine }
    }

    /// Construct a single-frame volume from 3D data.
    pub fn from_3d(data: Array3<f32>, affine: Affine) -> Volume {
        Volume { data: data.insert_axis(Axis(3)), affine }
    }

    /// The extent of the voxel grid, ignoring frames.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    pub fn num_frames(&self) -> usize {
        self.data.shape()[3]
    }

    /// Interpret this volume as a label volume. Voxel values are rounded to the nearest integer.
    ///
    /// # Errors
    ///
    /// If the volume has more than one frame.
    pub fn into_labels(self) -> Result<LabelVolume> {
        if self.num_frames() != 1 {
            return Err(ParcellationError::InvalidVolumeShape(self.data.shape().to_vec()));
        }
        let labels = self.data.index_axis(Axis(3), 0).mapv(|v| v.round() as i32);
        Ok(LabelVolume { labels, affine: self.affine })
    }
}


/// A discrete label image, e.g., a brain atlas, in which each voxel value identifies a region.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    pub labels: Array3<i32>,
    pub affine: Affine,
}

impl LabelVolume {
    pub fn new(labels: Array3<i32>, affine: Affine) -> LabelVolume {
        LabelVolume { labels, affine }
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.labels.shape();
        [s[0], s[1], s[2]]
    }

    /// The set of distinct label values present in the volume, including the background `0`.
    pub fn distinct_labels(&self) -> BTreeSet<i32> {
        self.labels.iter().copied().collect()
    }

    /// Resample into the grid given by `shape` and `affine` using nearest-neighbor interpolation.
    ///
    /// Target voxels that map outside of this volume are assigned the background label `0`.
    /// Nearest-neighbor is the only interpolation that keeps label identities intact.
    ///
    /// # Errors
    ///
    /// If the affine of this volume cannot be inverted.
    pub fn resample_nearest(&self, shape: [usize; 3], affine: &Affine) -> Result<LabelVolume> {
        let world_to_source = self.affine.inverse()
            .ok_or_else(|| ParcellationError::ShapeMismatch(self.shape().to_vec(), shape.to_vec()))?;
        let target_to_source = world_to_source.compose(affine);
        let src_shape = self.shape();

        let labels = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(i, j, k)| {
            let p = target_to_source.apply([i as f64, j as f64, k as f64]);
            let mut idx = [0usize; 3];
            for d in 0..3 {
                let v = p[d].round();
                if v < 0.0 || v >= src_shape[d] as f64 {
                    return 0;
                }
                idx[d] = v as usize;
            }
            self.labels[[idx[0], idx[1], idx[2]]]
        });
        Ok(LabelVolume { labels, affine: *affine })
    }

    /// Convert to a single-frame floating point [`Volume`], e.g., for writing to disk.
    pub fn to_volume(&self) -> Volume {
        Volume::from_3d(self.labels.mapv(|v| v as f32), self.affine)
    }
}


/// Read a volume from a NIfTI (`.nii`, `.nii.gz`) or FreeSurfer MGH (`.mgh`, `.mgz`) file. The format is determined from the file extension.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    match full_extension(path).as_str() {
        ".nii" | ".nii.gz" => read_nifti(path),
        ".mgh" | ".mgz" => read_mgh(path).map(|mgh| mgh.into_volume()),
        _ => Err(ParcellationError::UnsupportedVolumeFormat(path.to_path_buf())),
    }
}


/// Read a label volume, see [`read_volume`] and [`Volume::into_labels`].
pub fn read_label_volume<P: AsRef<Path>>(path: P) -> Result<LabelVolume> {
    read_volume(path)?.into_labels()
}


/// Write a volume to a NIfTI or MGH file. The format is determined from the file extension.
pub fn write_volume<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let path = path.as_ref();
    match full_extension(path).as_str() {
        ".nii" | ".nii.gz" => write_nifti(volume, path),
        ".mgh" | ".mgz" => write_mgh(volume, path),
        _ => Err(ParcellationError::UnsupportedVolumeFormat(path.to_path_buf())),
    }
}
