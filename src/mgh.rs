//! Functions for managing FreeSurfer brain volumes in binary 'MGH' files.
//!
//! MGH files store a 4D volume in big endian byte order, with the x axis varying fastest. MGZ
//! files are gzip-compressed MGH files. FreeSurfer writes its segmentations and atlases
//! (e.g., `aparc+aseg.mgz`) in this format.

use byteordered::ByteOrdered;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array, Array4, ShapeBuilder};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{ParcellationError, Result};
use crate::util::is_gz_file;
use crate::volume::{Affine, LabelVolume, Volume};

pub const MGH_VERSION: i32 = 1;

pub const MGH_DATATYPE_NAMES : [&str; 4] = ["MRI_UCHAR", "MRI_INT", "MRI_FLOAT", "MRI_SHORT"];
pub const MGH_DATATYPE_CODES : [i32; 4] = [0, 1, 3, 4];
pub const MGH_DATA_START : usize = 284; // The index in bytes where the data part starts in an MGH file.

const MRI_UCHAR: i32 = 0;
const MRI_INT: i32 = 1;
const MRI_FLOAT: i32 = 3;
const MRI_SHORT: i32 = 4;

/// Models the header of a FreeSurfer MGH file containing a brain volume.
#[derive(Debug, Clone, PartialEq)]
pub struct FsMghHeader {
    pub mgh_format_version: i32,
    pub dim1len: i32,
    pub dim2len: i32,
    pub dim3len: i32,
    pub dim4len: i32,  // aka "num_frames"
    pub dtype: i32,
    pub dof: i32,
    pub is_ras_good: i16,
    pub delta: [f32; 3],
    pub mdc_raw: [f32; 9],
    pub p_xyz_c: [f32; 3],
}


/// Models a FreeSurfer MGH file. Exactly one of the data fields is set, depending on the `dtype` of the header.
#[derive(Debug, Clone, PartialEq)]
pub struct FsMgh {
    pub header: FsMghHeader,
    pub data_mri_uchar: Option<Array4<u8>>,
    pub data_mri_float: Option<Array4<f32>>,
    pub data_mri_int: Option<Array4<i32>>,
    pub data_mri_short: Option<Array4<i16>>,
}


impl Default for FsMghHeader {
    fn default() -> FsMghHeader {
        FsMghHeader {
            mgh_format_version: MGH_VERSION,
            dim1len: 0,
            dim2len: 0,
            dim3len: 0,
            dim4len: 0,
            dtype: MRI_INT,
            dof: 0,
            is_ras_good: 0,
            delta: [0.; 3],
            mdc_raw: [0.; 9],
            p_xyz_c: [0.; 3],
        }
    }
}

/// The header of an MGH/MGZ file.
impl FsMghHeader {

    /// Read an MGH header from a file. If the file's name ends with ".mgz" or ".gz", it is gzip-decoded.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<FsMghHeader> {
        let gz = is_mgz_file(&path);
        let mut file = BufReader::new(File::open(path)?);
        if gz {
            FsMghHeader::from_reader(&mut GzDecoder::new(file))
        } else {
            FsMghHeader::from_reader(&mut file)
        }
    }


    /// Read an MGH header from the given byte stream.
    /// It is assumed that the input is currently at the start of the
    /// header. Exactly `MGH_DATA_START` bytes are consumed.
    pub fn from_reader<S>(input: &mut S) -> Result<FsMghHeader>
    where
        S: Read,
    {
        let mut hdr = FsMghHeader::default();

        let mut input = ByteOrdered::be(input);

        hdr.mgh_format_version = input.read_i32()?;

        if hdr.mgh_format_version != MGH_VERSION {
            return Err(ParcellationError::InvalidFsMghFormat);
        }

        hdr.dim1len = input.read_i32()?;
        hdr.dim2len = input.read_i32()?;
        hdr.dim3len = input.read_i32()?;
        hdr.dim4len = input.read_i32()?;

        hdr.dtype = input.read_i32()?;
        hdr.dof = input.read_i32()?;

        hdr.is_ras_good = input.read_i16()?;
        let mut consumed: usize = 7 * 4 + 2;

        if hdr.is_ras_good == 1 {
            for idx in 0..3 { hdr.delta[idx] = input.read_f32()?; }
            for idx in 0..9 { hdr.mdc_raw[idx] = input.read_f32()?; }
            for idx in 0..3 { hdr.p_xyz_c[idx] = input.read_f32()?; }
            consumed += 15 * 4;
        } else {
            // FreeSurfer's default coronal (LIA) orientation with 1mm voxels.
            hdr.delta = [1.0; 3];
            hdr.mdc_raw = [-1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0];
            hdr.p_xyz_c = [0.0; 3];
        }

        let mut padding = vec![0u8; MGH_DATA_START - consumed];
        input.read_exact(&mut padding)?;

        for d in [hdr.dim1len, hdr.dim2len, hdr.dim3len, hdr.dim4len].iter() {
            if *d < 0 {
                return Err(ParcellationError::InvalidFsMghFormat);
            }
        }
        Ok(hdr)
    }


    /// The volume shape as (dim1, dim2, dim3, frames).
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.dim1len as usize, self.dim2len as usize, self.dim3len as usize, self.dim4len as usize)
    }


    /// The number of voxels over all frames.
    pub fn num_values(&self) -> usize {
        let (d1, d2, d3, d4) = self.dims();
        d1 * d2 * d3 * d4
    }


    /// Compute the vox2ras matrix from the header fields, the way FreeSurfer does it.
    ///
    /// The direction cosines `Mdc` are scaled by the voxel sizes `delta`, and the translation is
    /// chosen so that the center voxel maps to `p_xyz_c`.
    pub fn vox2ras(&self) -> Affine {
        let (d1, d2, d3, _) = self.dims();
        let center = [d1 as f64 / 2.0, d2 as f64 / 2.0, d3 as f64 / 2.0];
        let mut m = [[0.0; 4]; 4];
        for col in 0..3 {
            for row in 0..3 {
                m[row][col] = self.mdc_raw[col * 3 + row] as f64 * self.delta[col] as f64;
            }
        }
        for row in 0..3 {
            let mc: f64 = (0..3).map(|col| m[row][col] * center[col]).sum();
            m[row][3] = self.p_xyz_c[row] as f64 - mc;
        }
        m[3][3] = 1.0;
        Affine(m)
    }


    /// Construct a header for a volume of the given shape, data type and vox2ras matrix.
    pub fn for_volume(shape: &[usize], dtype: i32, affine: &Affine) -> FsMghHeader {
        let m = &affine.0;
        let delta = affine.voxel_sizes();
        let mut mdc_raw = [0.0f32; 9];
        for col in 0..3 {
            for row in 0..3 {
                let size = if delta[col] > 0.0 { delta[col] } else { 1.0 };
                mdc_raw[col * 3 + row] = (m[row][col] / size) as f32;
            }
        }
        let center = [shape[0] as f64 / 2.0, shape[1] as f64 / 2.0, shape[2] as f64 / 2.0];
        let c_ras = affine.apply(center);

        FsMghHeader {
            mgh_format_version: MGH_VERSION,
            dim1len: shape[0] as i32,
            dim2len: shape[1] as i32,
            dim3len: shape[2] as i32,
            dim4len: shape[3] as i32,
            dtype,
            dof: 0,
            is_ras_good: 1,
            delta: [delta[0] as f32, delta[1] as f32, delta[2] as f32],
            mdc_raw,
            p_xyz_c: [c_ras[0] as f32, c_ras[1] as f32, c_ras[2] as f32],
        }
    }


    fn to_writer<W: Write>(&self, output: W) -> Result<()> {
        let mut output = ByteOrdered::be(output);
        output.write_i32(self.mgh_format_version)?;
        output.write_i32(self.dim1len)?;
        output.write_i32(self.dim2len)?;
        output.write_i32(self.dim3len)?;
        output.write_i32(self.dim4len)?;
        output.write_i32(self.dtype)?;
        output.write_i32(self.dof)?;
        output.write_i16(self.is_ras_good)?;
        for v in self.delta.iter() { output.write_f32(*v)?; }
        for v in self.mdc_raw.iter() { output.write_f32(*v)?; }
        for v in self.p_xyz_c.iter() { output.write_f32(*v)?; }
        output.write_all(&[0u8; MGH_DATA_START - 90])?;
        Ok(())
    }
}


impl FsMgh {

    /// Read an MGH or MGZ file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<FsMgh> {
        let gz = is_mgz_file(&path);
        let file = BufReader::new(File::open(path)?);
        if gz {
            FsMgh::from_reader(GzDecoder::new(file))
        } else {
            FsMgh::from_reader(file)
        }
    }


    /// Read an MGH volume from the given byte stream, which must be at the start of the header.
    pub fn from_reader<S>(mut input: S) -> Result<FsMgh>
    where
        S: Read,
    {
        let hdr = FsMghHeader::from_reader(&mut input)?;
        let shape = hdr.dims().f();
        let n = hdr.num_values();
        let mut input = ByteOrdered::be(input);

        let mut mgh = FsMgh {
            header: hdr.clone(),
            data_mri_uchar: None,
            data_mri_int: None,
            data_mri_float: None,
            data_mri_short: None,
        };

        match hdr.dtype {
            MRI_UCHAR => {
                let mut data = vec![0u8; n];
                input.read_exact(&mut data)?;
                mgh.data_mri_uchar = Some(to_shape(shape, data)?);
            }
            MRI_INT => {
                let mut data = Vec::with_capacity(n);
                for _ in 0..n { data.push(input.read_i32()?); }
                mgh.data_mri_int = Some(to_shape(shape, data)?);
            }
            MRI_FLOAT => {
                let mut data = Vec::with_capacity(n);
                for _ in 0..n { data.push(input.read_f32()?); }
                mgh.data_mri_float = Some(to_shape(shape, data)?);
            }
            MRI_SHORT => {
                let mut data = Vec::with_capacity(n);
                for _ in 0..n { data.push(input.read_i16()?); }
                mgh.data_mri_short = Some(to_shape(shape, data)?);
            }
            other => return Err(ParcellationError::UnsupportedMghDataType(other)),
        }
        Ok(mgh)
    }


    /// Build an MGH volume with `MRI_FLOAT` data.
    pub fn from_volume(volume: &Volume) -> FsMgh {
        FsMgh {
            header: FsMghHeader::for_volume(volume.data.shape(), MRI_FLOAT, &volume.affine),
            data_mri_uchar: None,
            data_mri_int: None,
            data_mri_float: Some(volume.data.clone()),
            data_mri_short: None,
        }
    }


    /// Build an MGH volume with `MRI_INT` data from a label volume.
    pub fn from_label_volume(labels: &LabelVolume) -> FsMgh {
        let data = labels.labels.clone().insert_axis(ndarray::Axis(3));
        FsMgh {
            header: FsMghHeader::for_volume(data.shape(), MRI_INT, &labels.affine),
            data_mri_uchar: None,
            data_mri_int: Some(data),
            data_mri_float: None,
            data_mri_short: None,
        }
    }


    /// Convert the data, whatever its type, into a floating point [`Volume`] with the header's vox2ras matrix.
    pub fn into_volume(self) -> Volume {
        let affine = self.header.vox2ras();
        let data = if let Some(d) = self.data_mri_float {
            d
        } else if let Some(d) = self.data_mri_int {
            d.mapv(|v| v as f32)
        } else if let Some(d) = self.data_mri_short {
            d.mapv(|v| v as f32)
        } else if let Some(d) = self.data_mri_uchar {
            d.mapv(|v| v as f32)
        } else {
            Array4::zeros(self.header.dims().f())
        };
        Volume::new(data, affine)
    }


    /// Write the volume in MGH format to the given stream.
    pub fn to_writer<W: Write>(&self, output: W) -> Result<()> {
        let mut output = BufWriter::new(output);
        self.header.to_writer(&mut output)?;
        let mut out = ByteOrdered::be(&mut output);
        // Reversing the axes makes the iteration order x-fastest, as required by the format.
        if let Some(d) = &self.data_mri_float {
            for v in d.t().iter() { out.write_f32(*v)?; }
        } else if let Some(d) = &self.data_mri_int {
            for v in d.t().iter() { out.write_i32(*v)?; }
        } else if let Some(d) = &self.data_mri_short {
            for v in d.t().iter() { out.write_i16(*v)?; }
        } else if let Some(d) = &self.data_mri_uchar {
            for v in d.t().iter() { out.write_u8(*v)?; }
        }
        output.flush()?;
        Ok(())
    }


    /// Write the volume to a file. If the file's name ends with ".mgz" or ".gz", the output is gzip-compressed.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let gz = is_mgz_file(&path);
        let file = File::create(path)?;
        if gz {
            let mut encoder = GzEncoder::new(file, Compression::default());
            self.to_writer(&mut encoder)?;
            encoder.finish()?;
        } else {
            self.to_writer(file)?;
        }
        Ok(())
    }
}


fn to_shape<T>(shape: ndarray::Shape<ndarray::Ix4>, data: Vec<T>) -> Result<Array4<T>> {
    Array::from_shape_vec(shape, data).map_err(|_| ParcellationError::InvalidFsMghFormat)
}


fn is_mgz_file<P: AsRef<Path>>(path: P) -> bool {
    is_gz_file(&path) || path.as_ref().extension().map(|e| e == "mgz").unwrap_or(false)
}


/// Read an MGH or MGZ file.
pub fn read_mgh<P: AsRef<Path>>(path: P) -> Result<FsMgh> {
    FsMgh::from_file(path)
}


/// Write a volume to an MGH or MGZ file, using `MRI_FLOAT` data.
pub fn write_mgh<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    FsMgh::from_volume(volume).to_file(path)
}


#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn gradient_volume() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 5), |(i, j, k)| (i + 10 * j + 100 * k) as f32);
        let affine = Affine([
            [-1.0, 0.0, 0.0, 1.5],
            [0.0, 0.0, 1.0, -2.0],
            [0.0, -1.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        Volume::from_3d(data, affine)
    }

    #[test]
    fn an_mgz_file_can_be_written_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brain.mgz");
        let vol = gradient_volume();
        write_mgh(&vol, &path).unwrap();

        let mgh = read_mgh(&path).unwrap();
        assert_eq!((3, 4, 5, 1), mgh.header.dims());
        assert_eq!(3, mgh.header.dtype);
        assert!(mgh.data_mri_float.is_some());

        let back = mgh.into_volume();
        assert_eq!(vol.data, back.data);
        assert_abs_diff_eq!(vol.affine, back.affine, epsilon = 1e-5);
    }

    #[test]
    fn mgz_output_is_gzip_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brain.mgz");
        write_mgh(&gradient_volume(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&[0x1f, 0x8b], &bytes[0..2]);
    }

    #[test]
    fn uncompressed_data_is_stored_x_fastest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brain.mgh");
        write_mgh(&gradient_volume(), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(MGH_DATA_START + 3 * 4 * 5 * 4, bytes.len());
        let value_at = |idx: usize| {
            let o = MGH_DATA_START + idx * 4;
            f32::from_be_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
        };
        assert_eq!(0.0, value_at(0));
        assert_eq!(1.0, value_at(1)); // x = 1
        assert_eq!(10.0, value_at(3)); // y = 1
        assert_eq!(100.0, value_at(12)); // z = 1
    }

    #[test]
    fn label_volumes_are_stored_as_int() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atlas.mgz");
        let labels = LabelVolume::new(Array3::from_elem((2, 2, 2), 42), Affine::identity());
        FsMgh::from_label_volume(&labels).to_file(&path).unwrap();

        let mgh = read_mgh(&path).unwrap();
        assert_eq!(1, mgh.header.dtype);
        let back = mgh.into_volume().into_labels().unwrap();
        assert_eq!(labels.labels, back.labels);
    }

    #[test]
    fn headers_without_ras_information_keep_the_flag() {
        let mut hdr = FsMghHeader::for_volume(&[3, 4, 5, 1], MRI_FLOAT, &gradient_volume().affine);
        hdr.is_ras_good = 0;
        let mut bytes = Vec::new();
        hdr.to_writer(&mut bytes).unwrap();
        assert_eq!(MGH_DATA_START, bytes.len());

        let back = FsMghHeader::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(0, back.is_ras_good);
        assert_eq!([1.0; 3], back.delta);
        assert_eq!([-1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0], back.mdc_raw);
    }

    #[test]
    fn a_wrong_version_is_rejected() {
        let bytes = vec![0u8; MGH_DATA_START];
        let result = FsMghHeader::from_reader(&mut bytes.as_slice());
        assert!(matches!(result, Err(ParcellationError::InvalidFsMghFormat)));
    }
}
