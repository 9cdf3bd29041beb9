//! Kernel, stride and padding planning for pooling and deconvolution.

use crate::{
    error::Error,
    ops::{
        deconvolution::DeconvolutionParam,
        pooling::{PoolingConvention, PoolingParam},
    },
};
use anyhow::{ensure, Result};
use std::ops::Range;

/// The input window of adaptive output position `o`.
///
/// `floor(o * input / output)..ceil((o + 1) * input / output)`, windows of neighboring outputs
/// may overlap.
pub fn adaptive_window(o: usize, input: usize, output: usize) -> Range<usize> {
    let start = o * input / output;
    let end = ((o + 1) * input + output - 1) / output;
    start..end
}

/// Kernel, stride and left / right padding per spatial dim.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct KernelDims {
    /// Kernel size.
    pub kernel: Vec<usize>,
    /// Strides.
    pub strides: Vec<usize>,
    /// Padding before.
    pub pad_l: Vec<usize>,
    /// Padding after.
    pub pad_r: Vec<usize>,
}

impl KernelDims {
    /// The number of spatial dims.
    pub fn ndim(&self) -> usize {
        self.kernel.len()
    }
    /// Whether there is any padding.
    pub fn is_padded(&self) -> bool {
        self.pad_l.iter().chain(self.pad_r.iter()).any(|p| *p != 0)
    }
}

/// The uniform kernel equivalent to adaptive pooling from `input` to `output` spatial dims.
///
/// Returns `None` when an output dim is 0 or does not divide its input dim.
pub fn adaptive_uniform_kernel(input: &[usize], output: &[usize]) -> Option<KernelDims> {
    if input.len() != output.len() {
        return None;
    }
    let mut dims = KernelDims::default();
    for (&i, &o) in input.iter().zip(output) {
        if o == 0 || i % o != 0 {
            return None;
        }
        let stride = (2 * i) / o - i / o;
        let kernel = (2 * i + o - 1) / o - i / o;
        let pad = (stride * (o - 1) + kernel).saturating_sub(i) / 2;
        dims.kernel.push(kernel);
        dims.strides.push(stride);
        dims.pad_l.push(pad);
        dims.pad_r.push(pad);
    }
    Some(dims)
}

/// Right padding so that the "full" convention covers every input element.
pub fn padding_size_full(x: usize, pad_l: usize, pad_r: usize, kernel: usize, stride: usize) -> usize {
    let extent = (x + pad_l + pad_r).saturating_sub(kernel);
    let rem = extent % stride;
    if rem != 0 {
        pad_r + stride - rem
    } else {
        pad_r
    }
}

/// Kernel dims from explicit pooling parameters.
///
/// `data_dims` is the full input shape, including batch and channels.
///
/// **Errors**
/// - The parameters have fewer entries than the kernel.
/// - The input rank does not match the kernel.
/// - A kernel dim is 0.
pub fn prepare_kernels(param: &PoolingParam, data_dims: &[usize]) -> Result<KernelDims> {
    let nd = param.kernel.len();
    ensure!(
        (1..=3).contains(&nd) && data_dims.len() == nd + 2,
        Error::Configuration(format!(
            "pooling kernel {:?} does not match input {data_dims:?}",
            param.kernel
        ))
    );
    ensure!(
        param.stride.len() >= nd && param.pad.len() >= nd,
        Error::Configuration(format!(
            "pooling stride {:?} and pad {:?} must have {nd} dims",
            param.stride, param.pad
        ))
    );
    let spatial = &data_dims[2..];
    let mut dims = KernelDims::default();
    if param.global_pool {
        dims.kernel = spatial.to_vec();
        dims.strides = vec![1; nd];
        dims.pad_l = vec![0; nd];
        dims.pad_r = vec![0; nd];
    } else {
        dims.kernel = param.kernel.clone();
        dims.strides = param.stride[..nd].to_vec();
        dims.pad_l = param.pad[..nd].to_vec();
        dims.pad_r = param.pad[..nd].to_vec();
        if param.pooling_convention == PoolingConvention::Full {
            for i in 0..nd {
                dims.pad_r[i] = padding_size_full(
                    spatial[i],
                    dims.pad_l[i],
                    dims.pad_r[i],
                    dims.kernel[i],
                    dims.strides[i],
                );
            }
        }
    }
    ensure!(
        dims.kernel.iter().all(|k| *k > 0),
        Error::Configuration("Filter dimensions cannot be zero.".into())
    );
    ensure!(
        dims.strides.iter().all(|s| *s > 0),
        Error::Configuration("pooling stride must be > 0".into())
    );
    Ok(dims)
}

/// [`prepare_kernels`] plus the padding constraint of the accelerated primitive.
///
/// **Errors**
/// - A non-zero left pad is not smaller than its kernel dim.
pub fn init_pooling_kernels(param: &PoolingParam, data_dims: &[usize]) -> Result<KernelDims> {
    let dims = prepare_kernels(param, data_dims)?;
    for (p, k) in dims.pad_l.iter().zip(dims.kernel.iter()) {
        ensure!(
            *p == 0 || p < k,
            Error::Configuration(format!("pad {p} must be smaller than kernel {k}"))
        );
    }
    Ok(dims)
}

/// The pooling output shape for input shape `input`.
///
/// **Errors**
/// - See [`prepare_kernels`].
pub fn pooling_output_shape(param: &PoolingParam, input: &[usize]) -> Result<Vec<usize>> {
    if let Some(output_size) = param.output_size.as_ref() {
        ensure!(
            input.len() == 2 + output_size.len(),
            Error::Configuration(format!(
                "adaptive output size {output_size:?} does not match input {input:?}"
            ))
        );
        let mut shape = input[..2].to_vec();
        shape.extend_from_slice(output_size);
        return Ok(shape);
    }
    let dims = prepare_kernels(param, input)?;
    let mut shape = input[..2].to_vec();
    for (i, x) in input[2..].iter().enumerate() {
        let padded = x + dims.pad_l[i] + dims.pad_r[i];
        ensure!(
            padded >= dims.kernel[i],
            Error::Configuration(format!(
                "pooling kernel {:?} larger than padded input {input:?}",
                dims.kernel
            ))
        );
        shape.push((padded - dims.kernel[i]) / dims.strides[i] + 1);
    }
    Ok(shape)
}

/// The deconvolution output shape for input shape `input`.
///
/// `o = (i - 1) * stride - 2 * pad + dilate * (kernel - 1) + 1 + adj`
///
/// **Errors**
/// - The input rank does not match the kernel.
/// - The padding exceeds the output.
pub fn deconv_output_shape(param: &DeconvolutionParam, input: &[usize]) -> Result<Vec<usize>> {
    param.check()?;
    let nd = param.kernel.len();
    ensure!(
        input.len() == nd + 2,
        Error::Configuration(format!(
            "deconvolution kernel {:?} does not match input {input:?}",
            param.kernel
        ))
    );
    let mut shape = vec![input[0], param.num_filter];
    for (i, x) in input[2..].iter().enumerate() {
        let extent = x.saturating_sub(1) * param.stride[i]
            + param.dilate[i] * (param.kernel[i] - 1)
            + 1
            + param.adj[i];
        ensure!(
            extent > 2 * param.pad[i],
            Error::Configuration(format!(
                "deconvolution pad {:?} too large for input {input:?}",
                param.pad
            ))
        );
        shape.push(extent - 2 * param.pad[i]);
    }
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::pooling::PoolType;

    #[test]
    fn adaptive_windows_overlap() {
        let windows: Vec<_> = (0..3).map(|o| adaptive_window(o, 5, 3)).collect();
        assert_eq!(windows, vec![0..2, 1..4, 3..5]);
    }

    #[test]
    fn adaptive_windows_uniform() {
        let windows: Vec<_> = (0..2).map(|o| adaptive_window(o, 4, 2)).collect();
        assert_eq!(windows, vec![0..2, 2..4]);
    }

    #[test]
    fn adaptive_uniform() {
        let dims = adaptive_uniform_kernel(&[4, 6], &[2, 3]).unwrap();
        assert_eq!(dims.kernel, vec![2, 2]);
        assert_eq!(dims.strides, vec![2, 2]);
        assert!(!dims.is_padded());
        assert!(adaptive_uniform_kernel(&[5, 4], &[3, 2]).is_none());
        assert!(adaptive_uniform_kernel(&[4, 4], &[0, 2]).is_none());
    }

    #[test]
    fn full_convention_padding() {
        // 5 + 0 + 0 - 2 = 3, 3 % 2 = 1
        assert_eq!(padding_size_full(5, 0, 0, 2, 2), 1);
        assert_eq!(padding_size_full(6, 0, 0, 2, 2), 0);
        assert_eq!(padding_size_full(7, 1, 1, 3, 3), 1);
        // 8 + 1 + 1 - 3 = 7, 7 % 3 = 1
        assert_eq!(padding_size_full(8, 1, 1, 3, 3), 3);
    }

    #[test]
    fn global_pool_kernels() {
        let param = PoolingParam::new([3, 3]).global();
        let dims = prepare_kernels(&param, &[1, 2, 7, 5]).unwrap();
        assert_eq!(dims.kernel, vec![7, 5]);
        assert_eq!(dims.strides, vec![1, 1]);
        assert!(!dims.is_padded());
    }

    #[test]
    fn zero_kernel_is_error() {
        let param = PoolingParam::new([0, 2]);
        let error = prepare_kernels(&param, &[1, 1, 4, 4]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }

    #[test]
    fn pad_not_smaller_than_kernel() {
        let param = PoolingParam::new([2, 2])
            .with_pad([2, 0])
            .with_pool_type(PoolType::Avg);
        assert!(init_pooling_kernels(&param, &[1, 1, 4, 4]).is_err());
        let param = param.with_pad([1, 0]);
        assert!(init_pooling_kernels(&param, &[1, 1, 4, 4]).is_ok());
    }

    #[test]
    fn output_shapes() {
        let param = PoolingParam::new([2, 2]).with_stride([2, 2]);
        assert_eq!(
            pooling_output_shape(&param, &[1, 3, 5, 5]).unwrap(),
            vec![1, 3, 2, 2]
        );
        let param = param.with_convention(PoolingConvention::Full);
        assert_eq!(
            pooling_output_shape(&param, &[1, 3, 5, 5]).unwrap(),
            vec![1, 3, 3, 3]
        );
        let param = DeconvolutionParam::new([3, 3], 4)
            .with_stride([2, 2])
            .with_pad([1, 1])
            .with_adj([1, 1]);
        // (3 - 1) * 2 - 2 + 2 + 1 + 1 = 6
        assert_eq!(
            deconv_output_shape(&param, &[2, 5, 3, 3]).unwrap(),
            vec![2, 4, 6, 6]
        );
    }
}
