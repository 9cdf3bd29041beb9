/*!
CPU neural network primitives with a signature keyed primitive cache.

Operators ([`ops`]) decide per call whether to run on the [`engine`] or on a reference
implementation. Engine primitives are compiled from layout negotiating primitive descriptors
and cached per [`ExecContext`](context::ExecContext), keyed by an
[`OpSignature`](signature::OpSignature) of the parameters and tensor descriptors of the call.

# Example
```
# use oxidnn::{context::{ExecContext, OpContext, OpReq}, ops::{Operator, adaptive_avg_pool::AdaptiveAvgPooling2D}, scalar::ScalarType, tensor::Tensor};
# fn main() -> anyhow::Result<()> {
let op = AdaptiveAvgPooling2D::new([2, 2]);
let x = Tensor::from_vec([1, 1, 4, 4], (0..16).map(|x| x as f32).collect())?;
let y = Tensor::zeros([1, 1, 2, 2], ScalarType::F32);
let mut exec = ExecContext::default();
let mut ctx = OpContext::new(&mut exec, false);
op.forward(&mut ctx, &[x], &[OpReq::Write], &[y.clone()])?;
assert_eq!(y.to_vec::<f32>()?, vec![2.5, 4.5, 10.5, 12.5]);
# Ok(())
# }
```

# Configuration
See [`config`] for the environment variables read by [`Config::global`](config::Config::global).

# Logging
Events are emitted with [`tracing`], install a subscriber to see them.
*/
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(doc_cfg, feature(doc_cfg))]

pub mod cache;
/// Runtime configuration.
pub mod config;
pub mod context;
pub mod engine;
/// Errors.
pub mod error;
pub mod exec;
pub mod memory;
pub mod ops;
pub mod planner;
/// Element types.
pub mod scalar;
pub mod signature;
pub mod tensor;
