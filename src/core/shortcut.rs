use crate::Result;
use std::path::Path;
use tracing::debug;

/// Creates and removes desktop shortcuts for registered programs
pub trait Shortcut: Send + Sync {
    fn create_shortcut(&self, target: &Path, display_name: &str) -> Result<()>;

    fn remove_shortcut(&self, display_name: &str) -> Result<()>;
}

/// Shortcut collaborator that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShortcuts;

impl Shortcut for NoShortcuts {
    fn create_shortcut(&self, target: &Path, display_name: &str) -> Result<()> {
        debug!(target = %target.display(), display_name, "shortcut creation skipped");
        Ok(())
    }

    fn remove_shortcut(&self, display_name: &str) -> Result<()> {
        debug!(display_name, "shortcut removal skipped");
        Ok(())
    }
}
