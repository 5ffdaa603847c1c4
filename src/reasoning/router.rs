// =============================================================================
// Reasoning Router — provider selection, JSON contract, usage accounting
// =============================================================================
//
// Provider order per invocation: explicit override, else the account's
// personal key, else the platform default. Retry policy:
//   Unavailable        -> one retry, then fall back to the other provider
//   MalformedResponse  -> one retry with a tightened instruction, then abandon
//   RateLimited        -> surfaced to the caller (the tick decides)
//   ContentFiltered    -> surfaced, never retried
//
// Concurrency per provider is capped with a semaphore; excess invocations
// wait a bounded time and then fail rate-limited. Every attempt writes an
// AI-usage row with token counts and estimated cost.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::EngineError;
use crate::reasoning::actions::{parse_outcome, ReasoningOutcome};
use crate::reasoning::provider::{estimate_cost, ProviderKind, ReasoningProvider};
use crate::secret_store::SecretStore;
use crate::store::Store;

/// Bounded wait for a provider slot before failing rate-limited.
const SLOT_WAIT: Duration = Duration::from_secs(10);

const SYSTEM_PROMPT: &str = "You are the reasoning core of an autonomous perpetuals trading agent. \
Respond with a single JSON object and nothing else, shaped as \
{\"interpretation\": string, \"actions\": [{\"kind\": \"buy\"|\"sell\"|\"hold\"|\"close\", \
\"symbol\": string, \"side\": \"long\"|\"short\", \"size\": number, \"leverage\": integer 1-10, \
\"reasoning\": string, \"expectedEntry\": number?, \"stopLoss\": number?, \"takeProfit\": number?}], \
\"riskManagement\": string, \"expectedOutcome\": string}. \
Propose only trades justified by the supplied market context.";

const TIGHTENED_INSTRUCTION: &str = "\nYour previous reply was not a valid JSON object. \
Reply with ONLY the JSON object described above: no prose, no markdown fences.";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub platform_provider: ProviderKind,
    pub openai_model: String,
    pub anthropic_model: String,
    pub deadline: Duration,
    pub concurrency: usize,
}

/// One reasoning invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub account_id: String,
    pub prompt: String,
    pub context: Value,
    pub preferred_provider: Option<ProviderKind>,
    pub model: Option<String>,
}

pub struct ReasoningRouter {
    http: reqwest::Client,
    store: Arc<Store>,
    secrets: Arc<SecretStore>,
    config: RouterConfig,
    limits: HashMap<ProviderKind, Arc<Semaphore>>,
}

impl ReasoningRouter {
    pub fn new(store: Arc<Store>, secrets: Arc<SecretStore>, config: RouterConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.deadline)
            .build()
            .expect("failed to build reasoning http client");

        let mut limits = HashMap::new();
        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic] {
            limits.insert(kind, Arc::new(Semaphore::new(config.concurrency.max(1))));
        }

        Self {
            http,
            store,
            secrets,
            config,
            limits,
        }
    }

    /// Route one request to a provider and return the validated action list.
    pub async fn invoke(&self, req: &InvokeRequest) -> Result<ReasoningOutcome, EngineError> {
        let order = self.provider_order(req)?;

        let mut last_err = EngineError::Unavailable("no reasoning provider configured".into());
        for (attempt, kind) in order.iter().enumerate() {
            match self.invoke_on(*kind, req).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ EngineError::Unavailable(_)) => {
                    warn!(
                        provider = %kind,
                        attempt,
                        error = %e,
                        "provider unavailable — trying fallback"
                    );
                    last_err = e;
                }
                // Everything else is not retryable across providers.
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Providers to try, in order. The preferred provider (explicit override
    /// or the one the account holds a personal key for) first, the platform
    /// default as fallback.
    fn provider_order(&self, req: &InvokeRequest) -> Result<Vec<ProviderKind>, EngineError> {
        let preferred = match req.preferred_provider {
            Some(kind) => Some(kind),
            None => self.personal_key_provider(&req.account_id),
        };

        let mut order = Vec::with_capacity(2);
        if let Some(kind) = preferred {
            order.push(kind);
        }
        if !order.contains(&self.config.platform_provider) {
            order.push(self.config.platform_provider);
        }
        Ok(order)
    }

    fn personal_key_provider(&self, account_id: &str) -> Option<ProviderKind> {
        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic] {
            if let Ok(Some(_)) = self.store.active_api_key(account_id, kind.as_str()) {
                return Some(kind);
            }
        }
        None
    }

    async fn invoke_on(
        &self,
        kind: ProviderKind,
        req: &InvokeRequest,
    ) -> Result<ReasoningOutcome, EngineError> {
        let provider = self.build_provider(kind, req)?;

        // Bounded wait for a concurrency slot.
        let semaphore = self.limits[&kind].clone();
        let _permit = tokio::time::timeout(SLOT_WAIT, semaphore.acquire_owned())
            .await
            .map_err(|_| EngineError::RateLimited {
                retry_after_secs: Some(SLOT_WAIT.as_secs()),
            })?
            .map_err(|_| EngineError::Unavailable("provider slot pool closed".into()))?;

        let user = format!(
            "{}\n\nMarket context:\n{}",
            req.prompt,
            serde_json::to_string_pretty(&req.context).unwrap_or_else(|_| "{}".into())
        );

        // First attempt, then one retry with a tightened instruction if the
        // reply does not parse.
        let mut unavailable_retry_done = false;
        let mut system = SYSTEM_PROMPT.to_string();
        let mut malformed_retry_done = false;

        loop {
            let result = provider
                .complete(&system, &user, self.config.deadline)
                .await;

            match result {
                Ok(reply) => {
                    let parsed = parse_outcome(&reply.content);
                    self.record_usage(req, &provider, Some(&reply), parsed.is_ok());

                    match parsed {
                        Ok(outcome) => {
                            info!(
                                account_id = %req.account_id,
                                provider = %kind,
                                actions = outcome.actions.len(),
                                "reasoning outcome parsed"
                            );
                            return Ok(outcome);
                        }
                        Err(e) if !malformed_retry_done => {
                            warn!(provider = %kind, error = %e, "malformed response — retrying once");
                            malformed_retry_done = true;
                            system = format!("{SYSTEM_PROMPT}{TIGHTENED_INSTRUCTION}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e @ EngineError::Unavailable(_)) if !unavailable_retry_done => {
                    warn!(provider = %kind, error = %e, "provider unavailable — retrying once");
                    unavailable_retry_done = true;
                }
                Err(e) => {
                    self.record_usage(req, &provider, None, false);
                    return Err(e);
                }
            }
        }
    }

    fn build_provider(
        &self,
        kind: ProviderKind,
        req: &InvokeRequest,
    ) -> Result<ReasoningProvider, EngineError> {
        let api_key = self.resolve_key(kind, &req.account_id)?;
        let model = req.model.clone().unwrap_or_else(|| match kind {
            ProviderKind::OpenAi => self.config.openai_model.clone(),
            ProviderKind::Anthropic => self.config.anthropic_model.clone(),
        });
        Ok(ReasoningProvider::new(kind, self.http.clone(), api_key, model))
    }

    /// Personal key first, platform key from the environment second.
    fn resolve_key(
        &self,
        kind: ProviderKind,
        account_id: &str,
    ) -> Result<Zeroizing<String>, EngineError> {
        if let Ok(Some(row)) = self.store.active_api_key(account_id, kind.as_str()) {
            if let Some(envelope) = &row.envelope {
                match self.secrets.open_value(envelope) {
                    Ok(key) => {
                        let _ = self.store.touch_api_key(&row.id);
                        return Ok(key);
                    }
                    Err(e) => {
                        warn!(account_id, provider = %kind, error = %e, "personal key unreadable");
                    }
                }
            }
        }

        match std::env::var(kind.platform_key_env()) {
            Ok(key) if !key.trim().is_empty() => Ok(Zeroizing::new(key)),
            _ => Err(EngineError::Unavailable(format!(
                "no API key available for provider {kind}"
            ))),
        }
    }

    fn record_usage(
        &self,
        req: &InvokeRequest,
        provider: &ReasoningProvider,
        reply: Option<&crate::reasoning::provider::ProviderReply>,
        success: bool,
    ) {
        let (prompt_tokens, completion_tokens) =
            reply.map_or((0, 0), |r| (r.prompt_tokens, r.completion_tokens));
        let cost = estimate_cost(provider.model(), prompt_tokens, completion_tokens);

        if let Err(e) = self.store.insert_ai_usage(
            &req.account_id,
            provider.kind().as_str(),
            provider.model(),
            prompt_tokens,
            completion_tokens,
            cost,
            success,
            &req.prompt,
        ) {
            warn!(error = %e, "failed to record ai usage");
        }
    }
}

impl std::fmt::Debug for ReasoningRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningRouter")
            .field("platform_provider", &self.config.platform_provider)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::{SecretStore, KEY_LEN};

    fn router_with(platform: ProviderKind) -> (ReasoningRouter, Arc<Store>) {
        let store = Store::open_in_memory().unwrap();
        let secrets = Arc::new(SecretStore::with_key([9u8; KEY_LEN], store.clone()));
        let config = RouterConfig {
            platform_provider: platform,
            openai_model: "gpt-4o".into(),
            anthropic_model: "claude-sonnet-4-20250514".into(),
            deadline: Duration::from_secs(5),
            concurrency: 2,
        };
        (ReasoningRouter::new(store.clone(), secrets, config), store)
    }

    fn request(account_id: &str, preferred: Option<ProviderKind>) -> InvokeRequest {
        InvokeRequest {
            account_id: account_id.into(),
            prompt: "evaluate BTC".into(),
            context: serde_json::json!({}),
            preferred_provider: preferred,
            model: None,
        }
    }

    #[test]
    fn provider_order_defaults_to_platform() {
        let (router, store) = router_with(ProviderKind::OpenAi);
        store.create_account("acct-1", None).unwrap();

        let order = router.provider_order(&request("acct-1", None)).unwrap();
        assert_eq!(order, vec![ProviderKind::OpenAi]);
    }

    #[test]
    fn explicit_preference_comes_first_with_platform_fallback() {
        let (router, store) = router_with(ProviderKind::OpenAi);
        store.create_account("acct-1", None).unwrap();

        let order = router
            .provider_order(&request("acct-1", Some(ProviderKind::Anthropic)))
            .unwrap();
        assert_eq!(order, vec![ProviderKind::Anthropic, ProviderKind::OpenAi]);
    }

    #[test]
    fn personal_key_sets_preference() {
        let (router, store) = router_with(ProviderKind::OpenAi);
        store.create_account("acct-1", None).unwrap();

        let secrets = SecretStore::with_key([9u8; KEY_LEN], store.clone());
        let envelope = secrets.seal_value("sk-personal").unwrap();
        store
            .insert_api_key("acct-1", "anthropic", "Anthropic", "personal", &envelope)
            .unwrap();

        let order = router.provider_order(&request("acct-1", None)).unwrap();
        assert_eq!(order, vec![ProviderKind::Anthropic, ProviderKind::OpenAi]);
    }
}
