//! NIfTI-1 volume I/O, based on the `nifti` crate.

use ndarray::{Axis, Ix4};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use std::path::Path;

use crate::error::{ParcellationError, Result};
use crate::volume::{Affine, Volume};


/// Read a `.nii` or `.nii.gz` file into a [`Volume`]. Data scaling (`scl_slope`, `scl_inter`) is applied.
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let obj = ReaderOptions::new().read_file(path.as_ref())?;
    let affine = header_affine(obj.header());
    let data = obj.into_volume().into_ndarray::<f32>()?;

    let shape = data.shape().to_vec();
    let data = match shape.len() {
        3 => data.insert_axis(Axis(3)),
        4 => data,
        _ => return Err(ParcellationError::InvalidVolumeShape(shape)),
    };
    let data = data.into_dimensionality::<Ix4>()
        .map_err(|_| ParcellationError::InvalidVolumeShape(shape))?;
    Ok(Volume::new(data, affine))
}


/// Write a [`Volume`] to a `.nii` or `.nii.gz` file, with the affine stored in the sform.
pub fn write_nifti<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let mut header = NiftiHeader::default();
    let m = &volume.affine.0;
    header.sform_code = 2;
    header.qform_code = 0;
    header.srow_x = [m[0][0] as f32, m[0][1] as f32, m[0][2] as f32, m[0][3] as f32];
    header.srow_y = [m[1][0] as f32, m[1][1] as f32, m[1][2] as f32, m[1][3] as f32];
    header.srow_z = [m[2][0] as f32, m[2][1] as f32, m[2][2] as f32, m[2][3] as f32];
    let sizes = volume.affine.voxel_sizes();
    header.pixdim[0] = 1.0;
    for i in 0..3 {
        header.pixdim[i + 1] = sizes[i] as f32;
    }

    let options = WriterOptions::new(path.as_ref()).reference_header(&header);
    if volume.num_frames() == 1 {
        options.write_nifti(&volume.data.index_axis(Axis(3), 0))?;
    } else {
        options.write_nifti(&volume.data)?;
    }
    Ok(())
}


/// Compute the voxel-to-world transform of a NIfTI header.
///
/// The sform is preferred if set, then the qform. Files without either get a scaling matrix from `pixdim`.
pub fn header_affine(header: &NiftiHeader) -> Affine {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut m = [[0.0; 4]; 4];
        for (i, row) in rows.iter().enumerate() {
            for j in 0..4 {
                m[i][j] = row[j] as f64;
            }
        }
        m[3][3] = 1.0;
        return Affine(m);
    }

    let pixdim = |i: usize| {
        let v = header.pixdim[i] as f64;
        if v > 0.0 { v } else { 1.0 }
    };

    if header.qform_code > 0 {
        let (b, c, d) = (header.quatern_b as f64, header.quatern_c as f64, header.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let r = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
        ];
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let scale = [pixdim(1), pixdim(2), pixdim(3) * qfac];
        let offset = [header.quatern_x as f64, header.quatern_y as f64, header.quatern_z as f64];
        let mut m = [[0.0; 4]; 4];
        for i in 0..3 {
            for j in 0..3 {
                m[i][j] = r[i][j] * scale[j];
            }
            m[i][3] = offset[i];
        }
        m[3][3] = 1.0;
        return Affine(m);
    }

    Affine::from_diagonal([pixdim(1), pixdim(2), pixdim(3)], [0.0; 3])
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn a_nifti_file_can_be_written_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub-01_desc-fa_epiref.nii.gz");
        let data = Array3::from_shape_fn((3, 4, 2), |(i, j, k)| (i + 10 * j + 100 * k) as f32);
        let affine = Affine::from_diagonal([2.0, 2.0, 3.0], [-10.0, 5.0, 1.0]);
        let vol = Volume::from_3d(data, affine);

        write_nifti(&vol, &path).unwrap();
        let back = read_nifti(&path).unwrap();

        assert_eq!([3, 4, 2], back.spatial_shape());
        assert_eq!(1, back.num_frames());
        assert_eq!(vol.data, back.data);
        assert_abs_diff_eq!(vol.affine, back.affine, epsilon = 1e-5);
    }

    #[test]
    fn headers_without_transforms_use_pixdim() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 0;
        header.pixdim = [1.0, 1.5, 2.0, 2.5, 0.0, 0.0, 0.0, 0.0];
        let aff = header_affine(&header);
        assert_eq!([1.5, 2.0, 2.5], aff.voxel_sizes());
    }

    #[test]
    fn identity_quaternions_give_axis_aligned_affines() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        header.quatern_x = 4.0;
        header.pixdim = [1.0, 2.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0];
        let aff = header_affine(&header);
        assert_abs_diff_eq!(aff, Affine::from_diagonal([2.0; 3], [4.0, 0.0, 0.0]), epsilon = 1e-12);
    }
}
