//! Lifecycle event pipelines.
//!
//! A [`Pipeline`] is an ordered list of subscriber stages fired with a single
//! payload value. Every lifecycle notification in this crate (accepted,
//! disconnected, idle timeout, request timeout, close) is an independent
//! pipeline:
//!
//! - Stages run in subscription order, each receiving the same initial value.
//! - A stage may suspend (any `async` stage); the firing resumes it in place.
//! - A stage failure is routed to the pipeline's failure handler and does
//!   **not** stop the remaining stages of the same firing.
//! - Two firings of the same pipeline never interleave: the second waits
//!   until every stage of the first has completed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use capstan_core::Pipeline;
//!
//! let pipeline: Pipeline<String> = Pipeline::new();
//! pipeline.subscribe(|name| async move {
//!     println!("hello {name}");
//!     Ok(())
//! });
//! pipeline.fire("world".to_string()).await?;
//! ```

use crate::Error;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// A type-erased pipeline stage.
pub type Stage<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Failure channel invoked with each stage error of a firing.
pub type FailHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// An ordered sequence of subscriber stages for one lifecycle event.
pub struct Pipeline<T> {
    stages: RwLock<Vec<Stage<T>>>,
    on_fail: RwLock<Option<FailHandler>>,
    /// Serializes firings: a later event of the same kind cannot interleave
    /// with an earlier one's stages.
    firing: tokio::sync::Mutex<()>,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(Vec::new()),
            on_fail: RwLock::new(None),
            firing: tokio::sync::Mutex::new(()),
        }
    }

    /// Append a stage. Stages run in subscription order.
    pub fn subscribe<F, Fut>(&self, stage: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.stages
            .write()
            .push(Arc::new(move |value| Box::pin(stage(value))));
    }

    /// Install the failure handler. It receives every stage error; at most
    /// one handler is kept (the latest wins).
    pub fn on_fail<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.on_fail.write() = Some(Arc::new(handler));
    }

    /// Fire the pipeline: run all stages in order with `value`.
    ///
    /// A stage error is routed to the failure handler and the remaining
    /// stages still run. Returns the last stage error, if any, so callers
    /// that own an isolation policy (the inspection sweep) can see it.
    pub async fn fire(&self, value: T) -> Result<(), Error> {
        let _guard = self.firing.lock().await;
        let stages: Vec<Stage<T>> = self.stages.read().clone();
        let mut last_error = None;
        for stage in stages {
            if let Err(error) = stage(value.clone()).await {
                warn!(%error, "pipeline stage failed");
                if let Some(handler) = self.on_fail.read().clone() {
                    handler(&error);
                }
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Number of subscribed stages.
    pub fn len(&self) -> usize {
        self.stages.read().len()
    }

    /// True when no stage is subscribed.
    pub fn is_empty(&self) -> bool {
        self.stages.read().is_empty()
    }
}

impl<T: Clone + Send + 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.read().len())
            .finish()
    }
}
