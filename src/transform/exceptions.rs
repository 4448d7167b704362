//! Obfuscators wrap whole method bodies in `try { .. } catch
//! (RuntimeException e) { throw wrapped(e); }` guards. Dropping the handler
//! entry is enough; the handler body itself becomes unreachable and the
//! dead-code pass collects it.

use anyhow::{Context, Result};

use crate::pool::ClassPool;
use crate::transform::Transformer;

const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";

pub(crate) struct RuntimeExceptionRemover {
    count: usize,
}

impl RuntimeExceptionRemover {
    pub(crate) fn new() -> Self {
        RuntimeExceptionRemover { count: 0 }
    }
}

impl Transformer for RuntimeExceptionRemover {
    fn name(&self) -> &'static str {
        "runtime-exception-remover"
    }

    fn run(&mut self, pool: &mut ClassPool) -> Result<()> {
        for id in pool.active_ids() {
            let class = pool.get_mut(id).context("active class vanished")?;
            for method in &mut class.methods {
                let before = method.try_catches.len();
                method
                    .try_catches
                    .retain(|tc| tc.catch_type.as_deref() != Some(RUNTIME_EXCEPTION));
                self.count += before - method.try_catches.len();
            }
        }
        log::info!("removed {} RuntimeException try-catch blocks", self.count);
        Ok(())
    }
}
