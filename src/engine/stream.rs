use super::{ArgMap, Primitive};
use anyhow::Result;
use std::sync::Arc;

/// Executes registered primitives in registration order.
#[derive(Debug, Default)]
pub struct Stream {
    pending: Vec<(Arc<dyn Primitive>, ArgMap)>,
    executed: usize,
}

impl Stream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers `primitive` with `args`, executed on [`.submit()`](Stream::submit).
    pub fn register(&mut self, primitive: Arc<dyn Primitive>, args: ArgMap) {
        tracing::trace!(primitive = primitive.name(), "register");
        self.pending.push((primitive, args));
    }
    /// The number of registered, not yet executed primitives.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
    /// The number of primitives executed so far.
    pub fn executed(&self) -> usize {
        self.executed
    }
    /// Executes every registered primitive.
    ///
    /// On error the remaining primitives are dropped.
    ///
    /// **Errors**
    /// - A primitive failed.
    pub fn submit(&mut self) -> Result<()> {
        for (primitive, args) in std::mem::take(&mut self.pending) {
            primitive.execute(&args)?;
            self.executed += 1;
        }
        Ok(())
    }
    /// Drops every registered primitive without executing it.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
