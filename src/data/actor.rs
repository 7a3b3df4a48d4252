//! Ambient acting identity.
//!
//! The authenticated caller is installed into task-local storage for the
//! duration of one request and read back by the audit filler. Spawned
//! tasks that outlive the request re-enter the scope explicitly with the
//! identity captured beforehand. Code running outside any scope resolves
//! to the `"system"` sentinel, never an error.

tokio::task_local! {
    static ACTOR: ActorIdentity;
}

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Default)]
pub struct ActorIdentity {
    pub user_code: Option<String>,
    pub id: Option<String>,
}

impl ActorIdentity {
    pub fn new(user_code: Option<String>, id: Option<String>) -> Self {
        Self { user_code, id }
    }

    fn resolve(&self) -> Option<String> {
        self.user_code.clone().or_else(|| self.id.clone())
    }
}

/// Run `fut` with `actor` installed as the ambient identity.
pub async fn with_actor<F>(actor: ActorIdentity, fut: F) -> F::Output
where
    F: std::future::Future,
{
    ACTOR.scope(actor, fut).await
}

/// The current acting identity: the user code, falling back to the user
/// id, falling back to `"system"` when no scope is active.
pub fn current_actor() -> String {
    ACTOR
        .try_with(ActorIdentity::resolve)
        .ok()
        .flatten()
        .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
}

/// Snapshot of the ambient identity, for handing to a spawned task that
/// must keep acting as the current caller.
pub fn capture_actor() -> ActorIdentity {
    ACTOR.try_with(Clone::clone).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_scope_resolves_to_system() {
        assert_eq!(current_actor(), "system");
    }

    #[tokio::test]
    async fn user_code_wins_over_id() {
        let actor = ActorIdentity::new(Some("alice".into()), Some("42".into()));
        let resolved = with_actor(actor, async { current_actor() }).await;
        assert_eq!(resolved, "alice");
    }

    #[tokio::test]
    async fn id_is_the_fallback() {
        let actor = ActorIdentity::new(None, Some("42".into()));
        let resolved = with_actor(actor, async { current_actor() }).await;
        assert_eq!(resolved, "42");
    }

    #[tokio::test]
    async fn empty_identity_resolves_to_system() {
        let resolved = with_actor(ActorIdentity::default(), async { current_actor() }).await;
        assert_eq!(resolved, "system");
    }

    #[tokio::test]
    async fn survives_await_points() {
        let actor = ActorIdentity::new(Some("alice".into()), None);
        let resolved = with_actor(actor, async {
            tokio::task::yield_now().await;
            current_actor()
        })
        .await;
        assert_eq!(resolved, "alice");
    }

    #[tokio::test]
    async fn spawned_tasks_need_explicit_rewrap() {
        let actor = ActorIdentity::new(Some("alice".into()), None);
        let (bare, rewrapped) = with_actor(actor, async {
            let bare = tokio::spawn(async { current_actor() }).await.unwrap();
            let captured = capture_actor();
            let rewrapped =
                tokio::spawn(with_actor(captured, async { current_actor() })).await.unwrap();
            (bare, rewrapped)
        })
        .await;
        assert_eq!(bare, "system");
        assert_eq!(rewrapped, "alice");
    }

    #[tokio::test]
    async fn concurrent_scopes_do_not_leak() {
        let a = with_actor(ActorIdentity::new(Some("a".into()), None), async {
            tokio::task::yield_now().await;
            current_actor()
        });
        let b = with_actor(ActorIdentity::new(Some("b".into()), None), async {
            tokio::task::yield_now().await;
            current_actor()
        });
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!((ra.as_str(), rb.as_str()), ("a", "b"));
    }
}
