//! Execution contexts.
//!
//! An [`ExecContext`] owns everything a call needs besides its tensors: the engine, the stream
//! primitives are registered on, the call-scoped temp arena and the primitive caches. Contexts
//! are not shared between threads, [`ExecContext::with_thread_local`] provides one per thread.

use crate::{
    cache::{CacheStats, PrimitiveCache},
    config::Config,
    engine::{Engine, Stream},
    memory::{Memory, MemoryDesc},
    ops::{
        batch_norm::BatchNormFwd,
        deconvolution::{DeconvBwd, DeconvFwd},
        pooling::{PoolingBwd, PoolingFwd},
    },
};
use anyhow::Result;
use std::cell::RefCell;

/// Write semantics of an output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OpReq {
    /// Skip the output.
    Null,
    /// Overwrite the output.
    Write,
    /// Overwrite the output, which may share storage with an input.
    WriteInPlace,
    /// Add to the output.
    AddTo,
}

/// Temp arena counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TempStats {
    /// Allocations since the context was created.
    pub allocations: usize,
    /// Bytes allocated since the context was created.
    pub bytes: usize,
    /// Allocations held by the current call.
    pub live: usize,
}

/// Call-scoped temporary memory.
///
/// Allocations are held until [`.release()`](TempSpace::release), at the end of every call.
#[derive(Debug, Default)]
pub struct TempSpace {
    live: Vec<Memory>,
    allocations: usize,
    bytes: usize,
}

impl TempSpace {
    /// Starts a call, dropping anything left over.
    pub fn init(&mut self) {
        self.live.clear();
    }
    /// Allocates zeroed memory for `desc`.
    ///
    /// **Errors**
    /// - The desc is not concrete.
    pub fn alloc(&mut self, desc: MemoryDesc) -> Result<Memory> {
        let bytes = desc.size_bytes();
        let memory = Memory::zeros(desc)?;
        self.allocations += 1;
        self.bytes += bytes;
        self.live.push(memory.clone());
        Ok(memory)
    }
    /// Releases the allocations of the call.
    pub fn release(&mut self) {
        self.live.clear();
    }
    /// The counters.
    pub fn stats(&self) -> TempStats {
        TempStats {
            allocations: self.allocations,
            bytes: self.bytes,
            live: self.live.len(),
        }
    }
}

/// Identifies one of the primitive caches of a context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CacheKind {
    /// Pooling forward.
    PoolingForward,
    /// Pooling backward.
    PoolingBackward,
    /// Deconvolution forward.
    DeconvForward,
    /// Deconvolution backward data and weights.
    DeconvBackward,
    /// Batch normalization forward.
    BatchNormForward,
}

#[derive(Debug)]
pub(crate) struct Caches {
    pub(crate) pooling_fwd: PrimitiveCache<PoolingFwd>,
    pub(crate) pooling_bwd: PrimitiveCache<PoolingBwd>,
    pub(crate) deconv_fwd: PrimitiveCache<DeconvFwd>,
    pub(crate) deconv_bwd: PrimitiveCache<DeconvBwd>,
    pub(crate) batch_norm_fwd: PrimitiveCache<BatchNormFwd>,
}

impl Caches {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            pooling_fwd: PrimitiveCache::with_capacity(capacity),
            pooling_bwd: PrimitiveCache::with_capacity(capacity),
            deconv_fwd: PrimitiveCache::with_capacity(capacity),
            deconv_bwd: PrimitiveCache::with_capacity(capacity),
            batch_norm_fwd: PrimitiveCache::with_capacity(capacity),
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<ExecContext>> = RefCell::new(None);
}

/// Engine, stream, temp arena and primitive caches.
#[derive(Debug)]
pub struct ExecContext {
    config: Config,
    engine: Engine,
    pub(crate) stream: Stream,
    pub(crate) temp: TempSpace,
    pub(crate) caches: Caches,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecContext {
    /// Creates a context with the [global](Config::global) config.
    pub fn new() -> Self {
        Self::with_config(Config::global().clone())
    }
    /// Creates a context with `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            engine: Engine::new(config.isa),
            caches: Caches::new(config.cache_capacity),
            config,
            stream: Stream::new(),
            temp: TempSpace::default(),
        }
    }
    /// Runs `f` with the context of the current thread.
    ///
    /// Re-entrant calls get a fresh context.
    pub fn with_thread_local<R>(f: impl FnOnce(&mut ExecContext) -> R) -> R {
        let context = CONTEXT.with(|cell| cell.borrow_mut().take());
        let mut context = context.unwrap_or_default();
        let output = f(&mut context);
        CONTEXT.with(|cell| cell.borrow_mut().replace(context));
        output
    }
    /// The config.
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// The engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
    /// The stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }
    /// The temp arena counters.
    pub fn temp_stats(&self) -> TempStats {
        self.temp.stats()
    }
    /// The counters of the cache for `kind`.
    pub fn cache_stats(&self, kind: CacheKind) -> CacheStats {
        match kind {
            CacheKind::PoolingForward => self.caches.pooling_fwd.stats(),
            CacheKind::PoolingBackward => self.caches.pooling_bwd.stats(),
            CacheKind::DeconvForward => self.caches.deconv_fwd.stats(),
            CacheKind::DeconvBackward => self.caches.deconv_bwd.stats(),
            CacheKind::BatchNormForward => self.caches.batch_norm_fwd.stats(),
        }
    }
    /// The number of entries in the cache for `kind`.
    pub fn cache_len(&self, kind: CacheKind) -> usize {
        match kind {
            CacheKind::PoolingForward => self.caches.pooling_fwd.len(),
            CacheKind::PoolingBackward => self.caches.pooling_bwd.len(),
            CacheKind::DeconvForward => self.caches.deconv_fwd.len(),
            CacheKind::DeconvBackward => self.caches.deconv_bwd.len(),
            CacheKind::BatchNormForward => self.caches.batch_norm_fwd.len(),
        }
    }
    /// Runs one call: initializes the temp arena, runs `f`, and releases the arena.
    ///
    /// Primitives registered but not submitted when `f` fails are dropped.
    pub(crate) fn scoped<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.temp.init();
        let output = f(self);
        if output.is_err() {
            self.stream.clear();
        }
        self.temp.release();
        output
    }
}

/// Per call context.
#[derive(Debug)]
pub struct OpContext<'a> {
    /// Whether the call is part of training.
    pub is_train: bool,
    /// The execution context.
    pub exec: &'a mut ExecContext,
}

impl<'a> OpContext<'a> {
    /// Creates an op context.
    pub fn new(exec: &'a mut ExecContext, is_train: bool) -> Self {
        Self { is_train, exec }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::Isa, scalar::ScalarType};

    #[test]
    fn temp_space_counts_and_releases() {
        let mut temp = TempSpace::default();
        temp.init();
        temp.alloc(MemoryDesc::plain([4], ScalarType::F32)).unwrap();
        temp.alloc(MemoryDesc::plain([2], ScalarType::I8)).unwrap();
        assert_eq!(
            temp.stats(),
            TempStats {
                allocations: 2,
                bytes: 18,
                live: 2
            }
        );
        temp.release();
        assert_eq!(temp.stats().live, 0);
        assert!(temp.alloc(MemoryDesc::any([2], ScalarType::F32)).is_err());
    }

    #[test]
    fn context_from_config() {
        let config = Config {
            accelerated: false,
            isa: Isa::Simd8,
            cache_capacity: Some(4),
        };
        let context = ExecContext::with_config(config.clone());
        assert_eq!(context.config(), &config);
        assert_eq!(context.engine().isa(), Isa::Simd8);
        assert_eq!(context.cache_len(CacheKind::PoolingForward), 0);
    }

    #[test]
    fn thread_local_persists() {
        ExecContext::with_thread_local(|context| {
            context.temp.alloc(MemoryDesc::plain([1], ScalarType::F32)).unwrap();
        });
        let allocations = ExecContext::with_thread_local(|context| context.temp_stats().allocations);
        assert!(allocations >= 1);
    }
}
