//! Thread-safe front end for incremental encoding.
//!
//! Block-coding threads submit precincts through a lock-free handle; any
//! thread may attempt a flush, which takes the codestream lock.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::emitter::{CodestreamOutput, FlushOutcome};
use super::image::CodestreamParams;
use super::layers::LayerSpec;
use super::packet::SubbandBlocks;
use super::precinct::PrecinctRef;
use super::rate_control::{RateControlConfig, RateControlContext};
use super::ready::PrecinctSubmitter;
use crate::error::PcrdError;

#[derive(Clone)]
pub struct SharedCodestream {
    inner: Arc<Mutex<RateControlContext>>,
    submitter: PrecinctSubmitter,
}

impl SharedCodestream {
    pub fn new(params: &CodestreamParams, layer_spec: LayerSpec, config: RateControlConfig) -> Result<Self, PcrdError> {
        let ctx = RateControlContext::new(params, layer_spec, config)?;
        Ok(Self::from_context(ctx))
    }

    pub fn from_context(ctx: RateControlContext) -> Self {
        let submitter = ctx.submitter();
        Self {
            inner: Arc::new(Mutex::new(ctx)),
            submitter,
        }
    }

    pub fn submitter(&self) -> PrecinctSubmitter {
        self.submitter.clone()
    }

    /// Queues a finished precinct. Never blocks on the codestream lock.
    pub fn submit(&self, precinct: PrecinctRef, subbands: Vec<SubbandBlocks>) -> Result<(), PcrdError> {
        self.submitter.submit(precinct, subbands)
    }

    pub fn lock(&self) -> MutexGuard<'_, RateControlContext> {
        self.inner.lock()
    }

    /// Flushes if ready, waiting for the lock.
    pub fn try_flush(&self) -> Result<FlushOutcome, PcrdError> {
        self.inner.lock().flush()
    }

    /// Flushes if ready and nobody else holds the lock. Returns `None` when
    /// another thread is busy with the codestream.
    pub fn try_flush_nonblocking(&self) -> Option<Result<FlushOutcome, PcrdError>> {
        self.inner.try_lock().map(|mut ctx| ctx.flush())
    }

    /// Collects the remaining precincts and emits everything at once.
    pub fn finish_sequential(&self) -> Result<CodestreamOutput, PcrdError> {
        self.inner.lock().emit_sequential()
    }

    /// Unwraps the context once every other handle is gone.
    pub fn into_inner(self) -> Result<RateControlContext, Self> {
        let submitter = self.submitter;
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner, submitter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jpeg2000::codeblock::CodeBlock;
    use crate::jpeg2000::image::{ComponentParams, SubbandOrientation};
    use crate::jpeg2000::progression::ProgressionOrder;
    use std::thread;

    fn params() -> CodestreamParams {
        CodestreamParams::single_tile(
            32,
            32,
            vec![ComponentParams::new(1, 1, 0).with_precincts(vec![(3, 3)])],
            2,
            ProgressionOrder::LayerResolutionComponentPosition,
        )
    }

    fn subbands(seed: usize) -> Vec<SubbandBlocks> {
        let pairs = [(0, 0), (10 + seed as u32, 4000), (30 + seed as u32, 1000)];
        let block = CodeBlock::from_pairs(&pairs, 0).unwrap();
        vec![SubbandBlocks::new(SubbandOrientation::LL, 1, 1, vec![block]).unwrap()]
    }

    #[test]
    fn test_threads_submit_then_emit() {
        let shared = SharedCodestream::new(&params(), LayerSpec::Slopes(vec![2000, 0]), RateControlConfig::default())
            .unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let submitter = shared.submitter();
                thread::spawn(move || {
                    for i in 0..4 {
                        let index = t * 4 + i;
                        submitter.submit(PrecinctRef::new(0, 0, 0, index), subbands(index)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let out = shared.finish_sequential().unwrap();
        assert_eq!(out.tile_parts[0].packets.len(), 32);
        let ctx = shared.into_inner().ok().unwrap();
        assert!(ctx.is_complete());
    }

    #[test]
    fn test_nonblocking_flush_yields_to_lock_holder() {
        let shared = SharedCodestream::new(&params(), LayerSpec::Slopes(vec![2000, 0]), RateControlConfig::default())
            .unwrap();
        let guard = shared.lock();
        assert!(shared.try_flush_nonblocking().is_none());
        drop(guard);
        assert_eq!(shared.try_flush_nonblocking(), Some(Ok(FlushOutcome::Deferred)));
    }
}
