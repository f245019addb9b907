//! Signed-in account handle.
//!
//! The account/session layer lives outside this crate; this is the narrow
//! view the connection code needs: the current account id and a way to wait
//! for sign-in.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable handle onto the current account id.
#[derive(Clone)]
pub struct Session {
    account: Arc<watch::Sender<Option<String>>>,
}

impl Session {
    pub fn new() -> Self {
        let (account, _) = watch::channel(None);
        Self {
            account: Arc::new(account),
        }
    }

    /// A session that is already signed in as `account_id`.
    pub fn signed_in_as(account_id: impl Into<String>) -> Self {
        let session = Self::new();
        session.sign_in(account_id);
        session
    }

    pub fn account_id(&self) -> Option<String> {
        self.account.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.account.borrow().is_some()
    }

    pub fn sign_in(&self, account_id: impl Into<String>) {
        let account_id = account_id.into();
        tracing::info!(%account_id, "signed in");
        self.account.send_replace(Some(account_id));
    }

    pub fn sign_out(&self) {
        tracing::info!("signed out");
        self.account.send_replace(None);
    }

    /// Wait until the session is signed in. Returns immediately if it already is.
    pub async fn signed_in(&self) {
        let mut rx = self.account.subscribe();
        // The sender lives in `self`, so this only errors if it is dropped
        // mid-wait, which cannot happen while we borrow it.
        let _ = rx.wait_for(|id| id.is_some()).await;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sign_in_and_out() {
        let session = Session::new();
        assert!(!session.is_signed_in());
        session.sign_in("acc1");
        assert_eq!(session.account_id().as_deref(), Some("acc1"));
        session.sign_out();
        assert!(session.account_id().is_none());
    }

    #[tokio::test]
    async fn signed_in_waits_for_event() {
        let session = Session::new();
        let waiter = session.clone();
        let task = tokio::spawn(async move {
            waiter.signed_in().await;
            waiter.account_id()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        session.sign_in("acc2");
        let id = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_deref(), Some("acc2"));
    }
}
