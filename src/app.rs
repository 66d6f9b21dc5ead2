use std::sync::Arc;

use crate::{
    config::Config, environment::Environment, jobs::catalog::JobCatalog, store::JobStore,
};

/// Shared state of a node, handed to every job handler through its context.
#[derive(Clone, Debug)]
pub struct App {
    pub config: Config,
    pub environment: Environment,
    pub store: Arc<dyn JobStore>,
}

impl App {
    #[must_use]
    pub fn new(config: Config, environment: Environment, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            environment,
            store,
        }
    }

    /// Catalog over this node's store, e.g. for handlers that schedule follow-up jobs.
    #[must_use]
    pub fn catalog(&self) -> JobCatalog {
        JobCatalog::new(self.store.clone())
    }
}
