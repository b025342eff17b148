//! LIFO release of resources acquired during startup.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tracing::{Span, debug, warn};

use crate::error::{ErrorList, Result};

/// A named cleanup step.
#[async_trait]
pub trait Teardown: Send {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>) -> Result<()>;
}

type TeardownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Adapts a closure returning a future into a [`Teardown`].
pub struct FnTeardown {
    name: String,
    action: Box<dyn FnOnce() -> TeardownFuture + Send>,
}

impl FnTeardown {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || -> TeardownFuture { Box::pin(action()) }),
        }
    }
}

#[async_trait]
impl Teardown for FnTeardown {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>) -> Result<()> {
        (self.action)().await
    }
}

#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<Box<dyn Teardown>>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: Box<dyn Teardown>) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every entry, last registered first. Failures do not stop the
    /// remaining entries; all of them are returned together.
    pub async fn run_all(self, span: &Span) -> std::result::Result<(), ErrorList> {
        let mut errors = ErrorList::new();
        for entry in self.entries.into_iter().rev() {
            let name = entry.name().to_string();
            debug!(parent: span, teardown = %name, "running teardown");
            if let Err(err) = entry.run().await {
                warn!(parent: span, teardown = %name, error = %err, "teardown failed");
                errors.push(err);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
