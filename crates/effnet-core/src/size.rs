//! Spatial size arithmetic for strided windowed operations.
//!
//! Output sizes follow the "SAME" convention (`ceil(input / stride)`), and
//! the padding needed to reach them is split with the smaller half before
//! and the larger half after, matching TensorFlow so that outputs are
//! bit-compatible with weights trained there.

use crate::error::{Error, Result};
use crate::types::SizeSpec;
use serde::{Deserialize, Serialize};

/// Resolve a size descriptor into `(height, width)`.
pub fn dimensions_from_size(size: &SizeSpec) -> Result<(usize, usize)> {
    match size {
        SizeSpec::Scalar(v) => Ok((*v, *v)),
        SizeSpec::Seq(values) if values.len() == 2 => Ok((values[0], values[1])),
        SizeSpec::Seq(values) => Err(Error::InvalidArgument(format!(
            "size must be an integer or a [height, width] pair, got {} values",
            values.len()
        ))),
    }
}

/// Resolve a stride descriptor into per-axis strides.
///
/// A scalar or a one-element sequence applies to both axes.
pub fn stride_pair(stride: &SizeSpec) -> Result<[usize; 2]> {
    let pair = match stride {
        SizeSpec::Scalar(s) => [*s, *s],
        SizeSpec::Seq(values) => match values.as_slice() {
            [s] => [*s, *s],
            [sh, sw] => [*sh, *sw],
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "stride must be an integer or a sequence of 1 or 2 values, got {} values",
                    values.len()
                )))
            }
        },
    };

    if pair.contains(&0) {
        return Err(Error::InvalidArgument("stride must be positive".to_string()));
    }
    Ok(pair)
}

/// Output `[height, width]` of a SAME-padded strided operation.
///
/// An unknown input size stays unknown: `None` in, `None` out.
pub fn output_size(input_size: Option<&SizeSpec>, stride: &SizeSpec) -> Result<Option<[usize; 2]>> {
    let Some(input_size) = input_size else {
        return Ok(None);
    };

    let (height, width) = dimensions_from_size(input_size)?;
    let [sh, sw] = stride_pair(stride)?;

    Ok(Some([height.div_ceil(sh), width.div_ceil(sw)]))
}

/// Total padding needed along one axis so that a window of `kernel_dim`
/// (dilated by `dilation`) stepping by `stride` yields `output_dim` outputs.
pub fn required_padding(
    input_dim: usize,
    output_dim: usize,
    stride: usize,
    kernel_dim: usize,
    dilation: usize,
) -> usize {
    let covered = output_dim.saturating_sub(1) * stride + kernel_dim.saturating_sub(1) * dilation + 1;
    covered.saturating_sub(input_dim)
}

/// Zero padding to apply around a `[.., height, width]` tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamePadding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl SamePadding {
    /// Split total per-axis padding: `floor(pad / 2)` before, the rest after.
    pub fn split(pad_h: usize, pad_w: usize) -> Self {
        Self {
            top: pad_h / 2,
            bottom: pad_h - pad_h / 2,
            left: pad_w / 2,
            right: pad_w - pad_w / 2,
        }
    }

    /// True when no padding is needed on any side
    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }

    /// Padding in `(left, right, top, bottom)` order
    pub fn as_lrtb(&self) -> (usize, usize, usize, usize) {
        (self.left, self.right, self.top, self.bottom)
    }
}

/// SAME padding for an input of `[height, width]`.
pub fn same_padding(
    input: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
) -> Result<SamePadding> {
    if stride.contains(&0) {
        return Err(Error::InvalidArgument("stride must be positive".to_string()));
    }
    if kernel.contains(&0) || dilation.contains(&0) {
        return Err(Error::InvalidArgument(
            "kernel size and dilation must be positive".to_string(),
        ));
    }

    let [ih, iw] = input;
    let (oh, ow) = (ih.div_ceil(stride[0]), iw.div_ceil(stride[1]));
    let pad_h = required_padding(ih, oh, stride[0], kernel[0], dilation[0]);
    let pad_w = required_padding(iw, ow, stride[1], kernel[1], dilation[1]);

    Ok(SamePadding::split(pad_h, pad_w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_from_size() {
        assert_eq!(dimensions_from_size(&SizeSpec::Scalar(224)).unwrap(), (224, 224));
        assert_eq!(dimensions_from_size(&SizeSpec::hw(240, 320)).unwrap(), (240, 320));
    }

    #[test]
    fn test_dimensions_from_size_rejects_bad_shapes() {
        for values in [vec![], vec![224], vec![1, 2, 3]] {
            let err = dimensions_from_size(&SizeSpec::Seq(values)).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_output_size_rounds_up() {
        let out = output_size(Some(&SizeSpec::Scalar(225)), &SizeSpec::Scalar(2)).unwrap();
        assert_eq!(out, Some([113, 113]));

        let out = output_size(Some(&SizeSpec::hw(224, 100)), &SizeSpec::Seq(vec![2])).unwrap();
        assert_eq!(out, Some([112, 50]));

        let out = output_size(Some(&SizeSpec::hw(224, 100)), &SizeSpec::hw(1, 2)).unwrap();
        assert_eq!(out, Some([224, 50]));
    }

    #[test]
    fn test_output_size_propagates_unknown() {
        assert_eq!(output_size(None, &SizeSpec::Scalar(2)).unwrap(), None);
    }

    #[test]
    fn test_output_size_rejects_zero_stride() {
        let err = output_size(Some(&SizeSpec::Scalar(224)), &SizeSpec::Scalar(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_required_padding() {
        // 224 -> 112 with k3 s2 needs a single extra row/column
        assert_eq!(required_padding(224, 112, 2, 3, 1), 1);
        // stride 1 keeps size, k3 needs 2
        assert_eq!(required_padding(56, 56, 1, 3, 1), 2);
        // dilation widens the window
        assert_eq!(required_padding(56, 56, 1, 3, 2), 4);
        // never negative
        assert_eq!(required_padding(7, 4, 2, 1, 1), 0);
    }

    #[test]
    fn test_same_padding_split_is_asymmetric() {
        let pad = same_padding([224, 224], [3, 3], [2, 2], [1, 1]).unwrap();
        assert_eq!(
            pad,
            SamePadding {
                top: 0,
                bottom: 1,
                left: 0,
                right: 1
            }
        );
        assert_eq!(pad.as_lrtb(), (0, 1, 0, 1));
    }

    #[test]
    fn test_same_padding_odd_input() {
        // 225 -> 113: (112 * 2) + 3 - 225 = 2, split evenly
        let pad = same_padding([225, 224], [3, 3], [2, 2], [1, 1]).unwrap();
        assert_eq!((pad.top, pad.bottom), (1, 1));
        assert_eq!((pad.left, pad.right), (0, 1));
    }

    #[test]
    fn test_same_padding_pointwise_is_zero() {
        let pad = same_padding([56, 56], [1, 1], [1, 1], [1, 1]).unwrap();
        assert!(pad.is_zero());
    }

    #[test]
    fn test_same_padding_rejects_zero_kernel() {
        assert!(same_padding([8, 8], [0, 3], [1, 1], [1, 1]).is_err());
    }
}
