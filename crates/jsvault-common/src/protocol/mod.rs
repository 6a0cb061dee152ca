pub mod changes;
pub mod error;
pub mod messages;

pub use changes::{ChangeKind, FileChange};
pub use error::{JsVaultError, Result};
pub use messages::{ConsoleLogRes, TaskRequest, JOIN_TYPE};
