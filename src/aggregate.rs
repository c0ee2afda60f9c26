//! Reduction of per-voxel metric images to per-region values.

use ndarray::{Array1, Axis, Zip};
use ndarray_stats::{QuantileExt, SummaryStatisticsExt};
use serde::{Deserialize, Serialize};

use std::borrow::Cow;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use crate::error::{ParcellationError, Result};
use crate::label_table::LabelTable;
use crate::volume::{LabelVolume, Volume};


/// The statistic computed over the voxels of a region. NaN voxel values are ignored by all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Aggregation {
    Mean,
    Median,
    /// Population standard deviation.
    Std,
    Min,
    Max,
}

impl Default for Aggregation {
    fn default() -> Aggregation {
        Aggregation::Mean
    }
}

impl Aggregation {
    /// The `meas` entity used in result file names.
    pub fn measure_name(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
            Aggregation::Std => "std",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }

    /// Apply to a set of values. Returns NaN if nothing remains after dropping NaNs.
    pub fn apply(&self, values: Array1<f64>) -> f64 {
        let values: Array1<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Aggregation::Mean => values.mean().unwrap_or(f64::NAN),
            Aggregation::Median => median(values.to_vec()),
            Aggregation::Std => values.central_moment(2).map(f64::sqrt).unwrap_or(f64::NAN),
            Aggregation::Min => *values.min_skipnan(),
            Aggregation::Max => *values.max_skipnan(),
        }
    }
}

impl FromStr for Aggregation {
    type Err = ParcellationError;

    fn from_str(s: &str) -> Result<Aggregation> {
        match s.to_ascii_lowercase().as_str() {
            "mean" | "nanmean" => Ok(Aggregation::Mean),
            "median" | "nanmedian" => Ok(Aggregation::Median),
            "std" | "nanstd" => Ok(Aggregation::Std),
            "min" | "nanmin" => Ok(Aggregation::Min),
            "max" | "nanmax" => Ok(Aggregation::Max),
            other => Err(ParcellationError::InvalidConfig(format!("unknown aggregation '{}'", other))),
        }
    }
}

impl TryFrom<String> for Aggregation {
    type Error = ParcellationError;

    fn try_from(s: String) -> Result<Aggregation> {
        s.parse()
    }
}

impl From<Aggregation> for String {
    fn from(agg: Aggregation) -> String {
        agg.measure_name().to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.measure_name())
    }
}


fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}


/// Bring the label volume onto the voxel grid of the metric, if the shapes differ.
fn align_labels<'a>(labels: &'a LabelVolume, metric: &Volume) -> Result<Cow<'a, LabelVolume>> {
    let target = metric.spatial_shape();
    if labels.shape() == target {
        return Ok(Cow::Borrowed(labels));
    }
    let resampled = labels.resample_nearest(target, &metric.affine)?;
    if resampled.shape() != target {
        return Err(ParcellationError::ShapeMismatch(labels.shape().to_vec(), target.to_vec()));
    }
    Ok(Cow::Owned(resampled))
}


/// Collect the metric values at all voxels carrying `label`, pooled over all frames.
fn select_values(labels: &LabelVolume, metric: &Volume, label: i32) -> Array1<f64> {
    let mut values = Vec::new();
    for frame in metric.data.axis_iter(Axis(3)) {
        Zip::from(&labels.labels).and(frame).for_each(|&l, &v| {
            if l == label {
                values.push(v as f64);
            }
        });
    }
    Array1::from(values)
}


/// Compute the aggregation of the metric image over the voxels of one label.
///
/// If the label volume lives on a different grid, it is resampled into the metric grid with
/// nearest-neighbor interpolation first.
///
/// # Returns
///
/// NaN if no voxel carries the label, or if all selected metric values are NaN.
///
/// # Errors
///
/// `ShapeMismatch` if the grids cannot be brought into agreement.
pub fn reduce_region(labels: &LabelVolume, metric: &Volume, label: i32, aggregation: Aggregation) -> Result<f64> {
    let labels = align_labels(labels, metric)?;
    Ok(aggregation.apply(select_values(&labels, metric, label)))
}


/// Compute the aggregation of the metric image for every region of the label table, in table order.
///
/// # Examples
///
/// ```no_run
/// use neuroparc::{aggregate_regions, read_label_table, read_label_volume, read_volume, Aggregation};
/// let table = read_label_table("BNA_with_cerebellum.csv").unwrap();
/// let atlas = read_label_volume("sub-01_space-anat_desc-brainnetome_atlas.nii.gz").unwrap();
/// let fa = read_volume("sub-01_space-T1w_desc-fa_epiref.nii.gz").unwrap();
/// let values = aggregate_regions(&atlas, &table, &fa, Aggregation::Mean).unwrap();
/// assert_eq!(table.len(), values.len());
/// ```
pub fn aggregate_regions(labels: &LabelVolume, table: &LabelTable, metric: &Volume, aggregation: Aggregation) -> Result<Vec<f64>> {
    let labels = align_labels(labels, metric)?;
    let values = table.label.iter()
        .map(|&label| reduce_region(&labels, metric, label, aggregation))
        .collect::<Result<Vec<f64>>>()?;
    Ok(values)
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::volume::Affine;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array3};

    fn two_block_labels() -> LabelVolume {
        // label 1 in x == 0, label 2 in x == 1, background in x == 2
        LabelVolume::new(Array3::from_shape_fn((3, 3, 3), |(i, _, _)| if i < 2 { i as i32 + 1 } else { 0 }), Affine::identity())
    }

    fn metric_from_fn<F: Fn((usize, usize, usize)) -> f32>(f: F) -> Volume {
        Volume::from_3d(Array3::from_shape_fn((3, 3, 3), f), Affine::identity())
    }

    #[test]
    fn the_mean_of_a_label_block_is_computed() {
        let metric = metric_from_fn(|(i, _, _)| i as f32 * 10.0 + 1.0);
        assert_abs_diff_eq!(1.0, reduce_region(&two_block_labels(), &metric, 1, Aggregation::Mean).unwrap());
        assert_abs_diff_eq!(11.0, reduce_region(&two_block_labels(), &metric, 2, Aggregation::Mean).unwrap());
    }

    #[test]
    fn absent_labels_give_nan() {
        let metric = metric_from_fn(|_| 1.0);
        assert!(reduce_region(&two_block_labels(), &metric, 7, Aggregation::Mean).unwrap().is_nan());
    }

    #[test]
    fn nan_voxels_are_ignored() {
        let metric = metric_from_fn(|(_, j, _)| if j == 0 { f32::NAN } else { j as f32 });
        assert_abs_diff_eq!(1.5, reduce_region(&two_block_labels(), &metric, 1, Aggregation::Mean).unwrap());
        let all_nan = metric_from_fn(|_| f32::NAN);
        assert!(reduce_region(&two_block_labels(), &all_nan, 1, Aggregation::Mean).unwrap().is_nan());
    }

    #[test]
    fn aggregations_compute_their_statistic() {
        let v = || arr1(&[1.0, 2.0, 3.0, 4.0, f64::NAN]);
        assert_abs_diff_eq!(2.5, Aggregation::Mean.apply(v()));
        assert_abs_diff_eq!(2.5, Aggregation::Median.apply(v()));
        assert_abs_diff_eq!(1.25f64.sqrt(), Aggregation::Std.apply(v()), epsilon = 1e-12);
        assert_abs_diff_eq!(1.0, Aggregation::Min.apply(v()));
        assert_abs_diff_eq!(4.0, Aggregation::Max.apply(v()));
        assert_abs_diff_eq!(2.0, Aggregation::Median.apply(arr1(&[3.0, 1.0, 2.0])));
        assert!(Aggregation::Max.apply(Array1::from(vec![])).is_nan());
    }

    #[test]
    fn aggregations_parse_from_numpy_style_names() {
        assert_eq!(Aggregation::Mean, "nanmean".parse().unwrap());
        assert_eq!(Aggregation::Std, "std".parse().unwrap());
        assert_eq!(Aggregation::Median, "NanMedian".parse().unwrap());
        assert!("mode".parse::<Aggregation>().is_err());
    }

    #[test]
    fn region_values_follow_label_table_order() {
        let table = LabelTable::from_pairs(vec![(2, "B"), (1, "A"), (9, "Z")]).unwrap();
        let metric = metric_from_fn(|(i, _, _)| (i as f32 + 1.0) * 10.0);
        let values = aggregate_regions(&two_block_labels(), &table, &metric, Aggregation::Mean).unwrap();
        assert_abs_diff_eq!(20.0, values[0]);
        assert_abs_diff_eq!(10.0, values[1]);
        assert!(values[2].is_nan());
    }

    #[test]
    fn labels_on_a_coarser_grid_are_resampled() {
        // one 2mm voxel per label covers two 1mm voxels along x
        let coarse = LabelVolume::new(
            Array3::from_shape_fn((2, 3, 3), |(i, _, _)| i as i32 + 1),
            Affine::from_diagonal([2.0, 1.0, 1.0], [0.0; 3]),
        );
        let fine = Volume::from_3d(
            Array3::from_shape_fn((4, 3, 3), |(i, _, _)| i as f32),
            Affine::identity(),
        );
        let table = LabelTable::from_pairs(vec![(1, "A"), (2, "B")]).unwrap();
        let values = aggregate_regions(&coarse, &table, &fine, Aggregation::Max).unwrap();
        assert_eq!(2, values.len());
        assert!(values[0] < values[1]);
    }

    #[test]
    fn singular_label_affines_are_a_shape_mismatch() {
        let mut degenerate = Affine::identity();
        degenerate.0[0][0] = 0.0;
        let labels = LabelVolume::new(Array3::zeros((2, 2, 2)), degenerate);
        let metric = metric_from_fn(|_| 1.0);
        let result = reduce_region(&labels, &metric, 1, Aggregation::Mean);
        assert!(matches!(result, Err(ParcellationError::ShapeMismatch(_, _))));
    }

    #[test]
    fn frames_are_pooled() {
        let data = ndarray::Array4::from_shape_fn((3, 3, 3, 2), |(_, _, _, t)| t as f32 * 2.0);
        let metric = Volume::new(data, Affine::identity());
        assert_abs_diff_eq!(1.0, reduce_region(&two_block_labels(), &metric, 1, Aggregation::Mean).unwrap());
    }
}
