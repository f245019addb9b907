pub mod id;
pub mod version;

pub use id::{account_user, inbox_prefix, new_inbox};
pub use version::{parse_semver, SemVer, SemVerError};
