//! Ordered controller registry.
//!
//! Controllers are matched in registration order; the first one whose
//! [`Controller::accepts`] returns `true` for the request's path and method
//! wins. Overlapping controllers are allowed, the earlier one always shadows
//! the later.

use std::sync::Arc;

use crate::controller::Controller;
use crate::http::Method;

/// Registration-ordered list of controllers.
#[derive(Clone, Default)]
pub struct Router {
    controllers: Vec<Arc<dyn Controller>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a controller; it matches after every controller already added.
    pub fn add(&mut self, controller: Arc<dyn Controller>) {
        self.controllers.push(controller);
    }

    /// Earliest registered controller accepting `(path, method)`.
    pub fn find(&self, path: &str, method: &Method) -> Option<&Arc<dyn Controller>> {
        self.controllers.iter().find(|c| c.accepts(path, method))
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("controllers", &self.controllers.len())
            .finish()
    }
}
