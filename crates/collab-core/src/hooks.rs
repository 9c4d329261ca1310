//! Extension pipeline (C7) — named lifecycle hooks, chained in
//! priority order, replacing exception-based control flow with an explicit
//! outcome type.

use crate::connection::{ConnectionId, Context};
use crate::crdt::Replica;
use crate::error::HookError;
use async_trait::async_trait;

/// Result of running one hook in a chain.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// Proceed to the next hook unchanged.
    Continue,
    /// Proceed, but replace the payload passed to subsequent hooks (used by
    /// `onChange` / stateless-message hooks to let an earlier extension
    /// rewrite what later ones see).
    ContinueWithPayload(Vec<u8>),
    /// Abort the operation this hook chain guards, with a reason surfaced to
    /// the client (e.g. `onAuthenticate` rejecting a connection).
    Reject(String),
}

/// Whether a failing hook aborts the operation (`Mandatory`) or is logged
/// and skipped (`Advisory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mandatory {
    Yes,
    No,
}

/// A named extension. Every method has a default no-op implementation so an
/// extension only overrides the hooks it cares about; `priority` controls
/// position in the chain (lower runs first), defaulting to the middle.
#[async_trait]
pub trait Hook<R: Replica>: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn mandatory(&self) -> Mandatory {
        Mandatory::No
    }

    async fn on_connect(&self, _ctx: &mut Context) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }

    async fn on_authenticate(
        &self,
        _ctx: &mut Context,
        _token: Option<&str>,
    ) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }

    async fn on_create_document(&self, _doc_name: &str) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }

    async fn on_load_document(
        &self,
        _doc_name: &str,
        _replica: &R,
    ) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }

    async fn after_load_document(&self, _doc_name: &str, _replica: &R) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_change(
        &self,
        _doc_name: &str,
        _update: &[u8],
        _origin_connection: Option<ConnectionId>,
    ) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }

    async fn on_store_document(&self, _doc_name: &str, _state: &[u8]) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_store_document(&self, _doc_name: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn before_unload_document(&self, _doc_name: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_unload_document(&self, _doc_name: &str) {}

    async fn on_disconnect(&self, _ctx: &Context, _doc_name: &str) {}

    async fn on_destroy(&self) {}

    /// Lets an extension answer a `Stateless` envelope out-of-band from the
    /// CRDT document entirely.
    async fn on_stateless(
        &self,
        _doc_name: &str,
        _payload: &[u8],
    ) -> Result<HookOutcome, HookError> {
        Ok(HookOutcome::Continue)
    }
}

/// An ordered, priority-sorted chain of hooks, built once at server
/// construction and shared read-only thereafter.
pub struct HookChain<R: Replica> {
    hooks: Vec<Box<dyn Hook<R>>>,
}

impl<R: Replica> HookChain<R> {
    pub fn new(mut hooks: Vec<Box<dyn Hook<R>>>) -> Self {
        hooks.sort_by_key(|h| h.priority());
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `on_connect` across the chain, stopping at the first `Reject`.
    /// A failing mandatory hook aborts with its error; a failing advisory
    /// hook is skipped.
    pub async fn run_on_connect(&self, ctx: &mut Context) -> Result<HookOutcome, HookError> {
        for hook in &self.hooks {
            match hook.on_connect(ctx).await {
                Ok(HookOutcome::Reject(reason)) => return Ok(HookOutcome::Reject(reason)),
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_connect failed");
                }
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn run_on_authenticate(
        &self,
        ctx: &mut Context,
        token: Option<&str>,
    ) -> Result<HookOutcome, HookError> {
        for hook in &self.hooks {
            match hook.on_authenticate(ctx, token).await {
                Ok(HookOutcome::Reject(reason)) => return Ok(HookOutcome::Reject(reason)),
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_authenticate failed");
                }
            }
        }
        Ok(HookOutcome::Continue)
    }

    /// Run `on_create_document` across the chain. Only invoked by the
    /// registry's load path when a document has no prior persisted state.
    pub async fn run_on_create_document(&self, doc_name: &str) -> Result<HookOutcome, HookError> {
        for hook in &self.hooks {
            match hook.on_create_document(doc_name).await {
                Ok(HookOutcome::Reject(reason)) => return Ok(HookOutcome::Reject(reason)),
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_create_document failed");
                }
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn run_on_load_document(
        &self,
        doc_name: &str,
        replica: &R,
    ) -> Result<HookOutcome, HookError> {
        for hook in &self.hooks {
            match hook.on_load_document(doc_name, replica).await {
                Ok(HookOutcome::Reject(reason)) => return Ok(HookOutcome::Reject(reason)),
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_load_document failed");
                }
            }
        }
        Ok(HookOutcome::Continue)
    }

    pub async fn run_after_load_document(&self, doc_name: &str, replica: &R) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_load_document(doc_name, replica).await {
                tracing::warn!(hook = hook.name(), error = %e, "after_load_document failed");
            }
        }
    }

    pub async fn run_on_change(
        &self,
        doc_name: &str,
        update: &[u8],
        origin_connection: Option<ConnectionId>,
    ) -> Result<Vec<u8>, HookError> {
        let mut payload = update.to_vec();
        for hook in &self.hooks {
            match hook.on_change(doc_name, &payload, origin_connection).await {
                Ok(HookOutcome::ContinueWithPayload(next)) => payload = next,
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_change failed");
                }
            }
        }
        Ok(payload)
    }

    pub async fn run_on_store_document(&self, doc_name: &str, state: &[u8]) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_store_document(doc_name, state).await {
                tracing::warn!(hook = hook.name(), error = %e, "on_store_document failed");
            }
        }
    }

    pub async fn run_after_store_document(&self, doc_name: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_store_document(doc_name).await {
                tracing::warn!(hook = hook.name(), error = %e, "after_store_document failed");
            }
        }
    }

    pub async fn run_before_unload_document(&self, doc_name: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.before_unload_document(doc_name).await {
                tracing::warn!(hook = hook.name(), error = %e, "before_unload_document failed");
            }
        }
    }

    pub async fn run_after_unload_document(&self, doc_name: &str) {
        for hook in &self.hooks {
            hook.after_unload_document(doc_name).await;
        }
    }

    pub async fn run_on_disconnect(&self, ctx: &Context, doc_name: &str) {
        for hook in &self.hooks {
            hook.on_disconnect(ctx, doc_name).await;
        }
    }

    pub async fn run_on_destroy(&self) {
        for hook in &self.hooks {
            hook.on_destroy().await;
        }
    }

    pub async fn run_on_stateless(
        &self,
        doc_name: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HookError> {
        let mut current = payload.to_vec();
        for hook in &self.hooks {
            match hook.on_stateless(doc_name, &current).await {
                Ok(HookOutcome::ContinueWithPayload(next)) => current = next,
                Ok(_) => {}
                Err(e) if hook.mandatory() == Mandatory::Yes => return Err(e),
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "advisory hook on_stateless failed");
                }
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::YrsReplica;

    struct RejectingAuth;

    #[async_trait]
    impl Hook<YrsReplica> for RejectingAuth {
        fn name(&self) -> &str {
            "rejecting-auth"
        }

        async fn on_authenticate(
            &self,
            _ctx: &mut Context,
            token: Option<&str>,
        ) -> Result<HookOutcome, HookError> {
            if token == Some("valid") {
                Ok(HookOutcome::Continue)
            } else {
                Ok(HookOutcome::Reject("invalid token".to_string()))
            }
        }
    }

    struct UppercaseOnChange;

    #[async_trait]
    impl Hook<YrsReplica> for UppercaseOnChange {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn priority(&self) -> i32 {
            10
        }

        async fn on_change(
            &self,
            _doc_name: &str,
            update: &[u8],
            _origin: Option<ConnectionId>,
        ) -> Result<HookOutcome, HookError> {
            Ok(HookOutcome::ContinueWithPayload(
                update.to_ascii_uppercase(),
            ))
        }
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_token() {
        let chain = HookChain::new(vec![Box::new(RejectingAuth)]);
        let mut ctx = Context::new();
        let outcome = chain.run_on_authenticate(&mut ctx, Some("nope")).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Reject(_)));

        let outcome = chain.run_on_authenticate(&mut ctx, Some("valid")).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Continue));
    }

    #[tokio::test]
    async fn on_change_payload_threads_through_chain() {
        let chain: HookChain<YrsReplica> = HookChain::new(vec![Box::new(UppercaseOnChange)]);
        let result = chain.run_on_change("doc", b"hi", None).await.unwrap();
        assert_eq!(result, b"HI");
    }

    #[test]
    fn hooks_run_in_priority_order() {
        struct Named(&'static str, i32);

        #[async_trait]
        impl Hook<YrsReplica> for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn priority(&self) -> i32 {
                self.1
            }
        }

        let chain: HookChain<YrsReplica> = HookChain::new(vec![
            Box::new(Named("c", 5)),
            Box::new(Named("a", -5)),
            Box::new(Named("b", 0)),
        ]);
        let names: Vec<_> = chain.hooks.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
