use ulid::Ulid;

/// Generates a new ULID-based token with the given prefix.
///
/// # Examples
/// ```
/// let id = bus_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known subject and identity prefixes.
pub mod prefix {
    pub const ACCOUNT: &str = "account";
    pub const PROJECT: &str = "project";
    pub const INBOX: &str = "_INBOX";
    pub const CONNECTION: &str = "conn";
    /// Server-side subject answering "what am I allowed to do".
    pub const SYS_USER_INFO: &str = "$SYS.REQ.USER.INFO";
}

/// The bus user name an account authenticates as.
pub fn account_user(account_id: &str) -> String {
    format!("{}-{}", prefix::ACCOUNT, account_id)
}

/// Inbox prefix owned by an account. Every reply subject for requests made
/// by that account lives under it.
pub fn inbox_prefix(account_id: &str) -> String {
    format!("{}.{}", prefix::INBOX, account_user(account_id))
}

/// A fresh, unique reply subject under `inbox_prefix`.
pub fn new_inbox(inbox_prefix: &str) -> String {
    format!("{}.{}", inbox_prefix, Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid("conn");
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn test_inbox_prefix_is_scoped_to_account() {
        assert_eq!(account_user("abc"), "account-abc");
        assert_eq!(inbox_prefix("abc"), "_INBOX.account-abc");
    }

    #[test]
    fn test_new_inbox_uniqueness() {
        let prefix = inbox_prefix("abc");
        let a = new_inbox(&prefix);
        let b = new_inbox(&prefix);
        assert!(a.starts_with("_INBOX.account-abc."));
        assert_ne!(a, b);
    }
}
