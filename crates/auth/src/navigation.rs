use std::sync::{Mutex, PoisonError};

use tracing::info;

/// Host navigation surface.
pub trait Navigator: Send + Sync + 'static {
    /// In-app route change; in-memory state survives.
    fn redirect(&self, path: &str);

    /// Full page load of `path`; nothing in memory survives.
    fn hard_navigate(&self, path: &str);

    /// Full reload of the current page.
    fn reload(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Redirect(String),
    Hard(String),
    Reload,
}

/// Navigator that records requests instead of performing them.
#[derive(Debug, Default)]
pub struct NavigationLog {
    entries: Mutex<Vec<Navigation>>,
}

impl NavigationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Navigation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Navigation> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    fn push(&self, navigation: Navigation) {
        info!(?navigation, "navigation requested");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(navigation);
    }
}

impl Navigator for NavigationLog {
    fn redirect(&self, path: &str) {
        self.push(Navigation::Redirect(path.to_string()));
    }

    fn hard_navigate(&self, path: &str) {
        self.push(Navigation::Hard(path.to_string()));
    }

    fn reload(&self) {
        self.push(Navigation::Reload);
    }
}
