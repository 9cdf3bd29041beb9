//! Operators.
//!
//! Every operator implements [`Operator`]. [`Op`] is the closed set of operators, dispatching
//! to the implementations.
//!
//! Operators with a reference implementation decide per call whether the accelerated path
//! applies, see [`Operator::supports_accelerated`]. The decision is not cached, only the
//! compiled primitives of the accelerated path are.

use crate::{
    config::Config,
    context::{OpContext, OpReq},
    error::Error,
    tensor::Tensor,
};
use anyhow::{ensure, Result};

pub mod adaptive_avg_pool;
pub mod batch_norm;
pub mod deconvolution;
pub mod pooling;
pub mod quantize;

use adaptive_avg_pool::AdaptiveAvgPooling2D;
use batch_norm::QuantizedBatchNorm;
use deconvolution::Deconvolution;
use pooling::Pooling;
use quantize::QuantizeV2;

/// Forward or backward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Pass {
    /// Forward.
    Forward,
    /// Backward.
    Backward,
}

/// How a call is executed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DispatchMode {
    /// With engine primitives.
    Accelerated,
    /// With the reference implementation.
    Fallback,
}

/// An operator.
pub trait Operator {
    /// The name, for logging.
    fn name(&self) -> &'static str;
    /// The output shapes of the forward pass for input shapes `inputs`.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] for invalid parameters or shapes.
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>>;
    /// Whether `pass` may run accelerated with the tensors of the call.
    ///
    /// Operators without a reference implementation always return
    /// [`DispatchMode::Accelerated`].
    fn supports_accelerated(
        &self,
        config: &Config,
        pass: Pass,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> DispatchMode;
    /// Runs the forward pass.
    ///
    /// **Errors**
    /// - [`Error::Configuration`] for invalid parameters, tensors or write requests.
    /// - [`Error::NoViableImplementation`] if no primitive could be built.
    fn forward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()>;
    /// Runs the backward pass.
    ///
    /// **Errors**
    /// - See [`.forward()`](Operator::forward).
    fn backward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()>;
}

/// The operators.
#[allow(missing_docs)]
#[derive(Debug)]
pub enum Op {
    AdaptiveAvgPooling2D(AdaptiveAvgPooling2D),
    Pooling(Pooling),
    Deconvolution(Deconvolution),
    QuantizeV2(QuantizeV2),
    QuantizedBatchNorm(QuantizedBatchNorm),
}

macro_rules! impl_op_from {
    ($($x:ident),+) => {
        $(
            impl From<$x> for Op {
                fn from(op: $x) -> Self {
                    Self::$x(op)
                }
            }
        )+
    };
}

impl_op_from! {AdaptiveAvgPooling2D, Pooling, Deconvolution, QuantizeV2, QuantizedBatchNorm}

macro_rules! map_op {
    ($op:expr, $x:ident => $e:expr) => {
        match $op {
            Op::AdaptiveAvgPooling2D($x) => $e,
            Op::Pooling($x) => $e,
            Op::Deconvolution($x) => $e,
            Op::QuantizeV2($x) => $e,
            Op::QuantizedBatchNorm($x) => $e,
        }
    };
}

impl Operator for Op {
    fn name(&self) -> &'static str {
        map_op!(self, x => x.name())
    }
    fn infer_shape(&self, inputs: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        map_op!(self, x => x.infer_shape(inputs))
    }
    fn supports_accelerated(
        &self,
        config: &Config,
        pass: Pass,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> DispatchMode {
        map_op!(self, x => x.supports_accelerated(config, pass, inputs, outputs))
    }
    fn forward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        map_op!(self, x => x.forward(ctx, inputs, req, outputs))
    }
    fn backward(
        &self,
        ctx: &mut OpContext,
        inputs: &[Tensor],
        req: &[OpReq],
        outputs: &[Tensor],
    ) -> Result<()> {
        map_op!(self, x => x.backward(ctx, inputs, req, outputs))
    }
}

/// Checks the number of inputs, write requests and outputs of a call.
pub(crate) fn check_io(
    name: &str,
    inputs: &[Tensor],
    num_inputs: &[usize],
    req: &[OpReq],
    outputs: &[Tensor],
    num_outputs: &[usize],
) -> Result<()> {
    ensure!(
        num_inputs.contains(&inputs.len()),
        Error::Configuration(format!(
            "{name} expects {num_inputs:?} inputs, found {}",
            inputs.len()
        ))
    );
    ensure!(
        num_outputs.contains(&outputs.len()) && req.len() == outputs.len(),
        Error::Configuration(format!(
            "{name} expects {num_outputs:?} outputs with a request each, found {} outputs and {} requests",
            outputs.len(),
            req.len()
        ))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ScalarType;

    #[test]
    fn op_delegates() {
        let op = Op::from(AdaptiveAvgPooling2D::new([2, 2]));
        assert_eq!(op.name(), "adaptive_avg_pooling2d");
        assert_eq!(
            op.infer_shape(&[vec![1, 3, 4, 4]]).unwrap(),
            vec![vec![1, 3, 2, 2]]
        );
    }

    #[test]
    fn check_io_counts() {
        let x = Tensor::zeros([1], ScalarType::F32);
        assert!(check_io("op", &[x.clone()], &[1], &[OpReq::Write], &[x.clone()], &[1]).is_ok());
        let error = check_io("op", &[], &[1], &[OpReq::Write], &[x], &[1]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Configuration(_))
        ));
    }
}
