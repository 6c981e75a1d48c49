use alyx_bus::derive_request_id;
use alyx_core::types::{new_id, EventType};
use alyx_store::{EventDraft, EventMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::triggers::{PreparedPublish, SourceTriggers};

/// Identity lifecycle moments that emit `auth` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityEventKind {
    Signup,
    Login,
    Logout,
    PasswordReset,
    EmailVerify,
}

impl IdentityEventKind {
    /// Only signup may be gated by sync hooks; to let a binding reject a
    /// registration. Everything else is observe-only.
    pub fn supports_sync(self) -> bool {
        matches!(self, IdentityEventKind::Signup)
    }
}

impl std::fmt::Display for IdentityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IdentityEventKind::Signup => "signup",
            IdentityEventKind::Login => "login",
            IdentityEventKind::Logout => "logout",
            IdentityEventKind::PasswordReset => "password_reset",
            IdentityEventKind::EmailVerify => "email_verify",
        };
        write!(f, "{s}")
    }
}

/// Source string for identity events; hooks usually bind with a wildcard.
const IDENTITY_SOURCE: &str = "users";

impl SourceTriggers {
    /// Gate an identity operation and hand back its event.
    ///
    /// For signup, sync `(auth, ..., signup)` hooks run first and may reject
    /// the registration; other kinds never block. Publish the returned
    /// value once the operation commits.
    pub async fn prepare_identity_event(
        &self,
        kind: IdentityEventKind,
        payload: Value,
    ) -> Result<PreparedPublish> {
        let event_id = new_id();
        let mut draft = EventDraft::new(
            EventType::Auth,
            IDENTITY_SOURCE,
            kind.to_string(),
            payload.clone(),
        )
        .with_id(event_id.clone());
        let meta = EventMeta::new(derive_request_id(&draft));
        draft = draft.with_metadata(meta.clone());

        if kind.supports_sync() {
            let (sync_hooks, _) = self.registry.find_matches_split(
                EventType::Auth,
                IDENTITY_SOURCE,
                &kind.to_string(),
            );
            self.run_sync_hooks(&sync_hooks, &payload, &meta, "auth", &event_id)
                .await?;
        }

        Ok(PreparedPublish { draft })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_signup_supports_sync() {
        assert!(IdentityEventKind::Signup.supports_sync());
        assert!(!IdentityEventKind::Login.supports_sync());
        assert!(!IdentityEventKind::Logout.supports_sync());
        assert!(!IdentityEventKind::PasswordReset.supports_sync());
        assert!(!IdentityEventKind::EmailVerify.supports_sync());
    }

    #[test]
    fn kinds_render_snake_case() {
        assert_eq!(IdentityEventKind::PasswordReset.to_string(), "password_reset");
        assert_eq!(IdentityEventKind::EmailVerify.to_string(), "email_verify");
    }
}
