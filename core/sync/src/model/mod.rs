//! Domain records kept in sync.

mod activity;
mod assignee;
mod listing;
mod note;
mod property;
mod task;
mod user;

pub use activity::{Activity, ActivityKind, ActivityWire};
pub use assignee::{ActivityAssignee, ActivityAssigneeWire, TaskAssignee, TaskAssigneeWire};
pub use listing::{Listing, ListingStatus, ListingWire};
pub use note::{Note, NoteWire};
pub use property::{Property, PropertyWire};
pub use task::{Task, TaskStatus, TaskWire};
pub use user::{User, UserWire};

use fieldsync_common::{Error, Result};

/// Reject blank required text columns.
pub(crate) fn require_text(column: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Decode(format!("{} must not be blank", column)));
    }
    Ok(())
}
