pub mod error;
pub mod locator;
pub mod patcher;
pub mod workspace;

pub use error::{Error, Result};
pub use locator::{ManifestTarget, locate};
pub use patcher::{PatchOutcome, patch_content, patch_file};
pub use workspace::{GitCredentials, Workspace, WorkspaceOptions};
