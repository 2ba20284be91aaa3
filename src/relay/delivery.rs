use crate::config::{Account, DestinationConfig};
use crate::feed::FeedItem;
use crate::storage::{PersistError, RelayState, StateStore};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors from posting one item to a destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network-level error. The webhook URL is stripped from the message.
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Destination answered with a non-2xx status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Webhook URL could not be parsed
    #[error("Invalid webhook URL")]
    InvalidWebhook,
}

/// Posts rendered messages to an account's destination.
pub trait Destination {
    fn deliver(
        &self,
        destination: &DestinationConfig,
        content: &str,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

/// Delivers to Discord-style webhooks: `POST {"content": ...}`, optionally into
/// a forum thread via `thread_id`.
#[derive(Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookDelivery {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn endpoint(destination: &DestinationConfig) -> Result<Url, DeliveryError> {
        let mut url = Url::parse(destination.webhook_url.expose_secret())
            .map_err(|_| DeliveryError::InvalidWebhook)?;
        {
            let mut query = url.query_pairs_mut();
            // Wait for the message to be created so a 2xx confirms delivery.
            query.append_pair("wait", "true");
            if let Some(thread_id) = &destination.thread_id {
                query.append_pair("thread_id", thread_id);
            }
        }
        Ok(url)
    }
}

impl Destination for WebhookDelivery {
    async fn deliver(
        &self,
        destination: &DestinationConfig,
        content: &str,
    ) -> Result<(), DeliveryError> {
        let url = Self::endpoint(destination)?;
        let request = self
            .client
            .post(url)
            .json(&WebhookMessage { content })
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| DeliveryError::Timeout)?
            .map_err(|e| DeliveryError::Network(e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}

/// Renders the message for one item from the account's template.
///
/// Placeholders: `{link}` (link as served), `{canonical}` and `{account}`.
pub fn render_message(template: &str, account: &Account, item: &FeedItem) -> String {
    template
        .replace("{link}", &item.display_link)
        .replace("{canonical}", &item.canonical_identity)
        .replace("{account}", &account.name)
}

/// Outcome of relaying one account's batch.
#[derive(Debug)]
pub struct RelayReport {
    /// Canonical identities delivered and persisted, in delivery order.
    pub delivered: Vec<String>,
    /// First failed item and why; items after it were not attempted.
    pub failure: Option<(FeedItem, DeliveryError)>,
}

/// Delivers an oldest-first batch, persisting the watermark after each item.
///
/// Stops at the first delivery failure so nothing is delivered out of order;
/// the failed item and everything after it are retried next cycle from the
/// durable watermark. A failed state write is returned as an error: the item
/// was delivered but is not recorded, and carrying on could deliver it twice.
pub async fn relay_batch<D, S>(
    account: &Account,
    batch: &[FeedItem],
    destination: &D,
    state: &mut RelayState,
    store: &S,
) -> Result<RelayReport, PersistError>
where
    D: Destination,
    S: StateStore + ?Sized,
{
    let mut delivered = Vec::with_capacity(batch.len());

    for item in batch {
        let message = render_message(&account.message_template, account, item);

        if let Err(e) = destination.deliver(&account.destination, &message).await {
            tracing::warn!(
                account = %account.name,
                item = %item.canonical_identity,
                error = %e,
                remaining = batch.len() - delivered.len(),
                "Delivery failed, stopping batch"
            );
            return Ok(RelayReport {
                delivered,
                failure: Some((item.clone(), e)),
            });
        }

        state.advance(&account.name, &item.canonical_identity);
        store.save(state)?;

        tracing::info!(
            account = %account.name,
            item = %item.canonical_identity,
            "Relayed item"
        );
        delivered.push(item.canonical_identity.clone());
    }

    Ok(RelayReport {
        delivered,
        failure: None,
    })
}
