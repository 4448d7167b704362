use anyhow::Result;

use crate::pool::ClassPool;

pub(crate) mod dead_code;
pub(crate) mod exceptions;
pub(crate) mod modmath;
pub(crate) mod multiplier;

/// One deobfuscation pass over the pool. Side effects are limited to method
/// bodies of active classes and a logged summary count.
pub(crate) trait Transformer {
    fn name(&self) -> &'static str;
    fn run(&mut self, pool: &mut ClassPool) -> Result<()>;
}

/// The pipeline, in its fixed execution order; later transforms observe the
/// mutations of earlier ones.
pub(crate) fn pipeline() -> Vec<Box<dyn Transformer>> {
    vec![
        Box::new(exceptions::RuntimeExceptionRemover::new()),
        Box::new(dead_code::DeadCodeRemover::new()),
        Box::new(multiplier::MultiplierFinder::new()),
    ]
}
