//! Outbound webhook fabric: the subscription registry, the outbox drain that
//! fans events out into deliveries, and the unlocked delivery worker with
//! signed, retried POSTs.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use joygate_config::Config;
use joygate_contracts::{DeliveryStatus, DeliveryView, SubscriptionView, WebhookEventType};
use joygate_kernel::egress::{forbidden_ip_reason, validate_target_url, EgressPolicy};
use joygate_kernel::{canonical_json, iso_z, mint_id, webhook_signature};

use crate::error::ApiError;
use crate::store::{
    Delivery, Store, Subscription, DELIVERIES_VIEW_CAP, DRAIN_BATCH, SUBSCRIPTIONS_ENABLED_CAP,
};

/// Everything the delivery worker needs outside the lock.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub delivery_id: String,
    pub target_url: String,
    pub payload_body: String,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub delivery_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
}

pub fn egress_policy(cfg: &Config) -> EgressPolicy {
    EgressPolicy {
        allow_http: cfg.webhooks.allow_http_targets,
        allow_loopback: cfg.webhooks.allow_loopback_targets,
    }
}

impl Store {
    pub fn create_subscription(
        &mut self,
        cfg: &Config,
        target_url: &str,
        event_types: &[WebhookEventType],
        secret: Option<String>,
        is_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionView, ApiError> {
        validate_target_url(target_url, &egress_policy(cfg))
            .map_err(|reason| ApiError::invalid("target_url", reason))?;
        if event_types.is_empty() {
            return Err(ApiError::invalid("event_types", "must not be empty"));
        }
        if is_enabled {
            let enabled = self
                .subscriptions
                .values()
                .filter(|s| s.is_enabled)
                .count();
            if enabled >= SUBSCRIPTIONS_ENABLED_CAP {
                return Err(ApiError::Capacity(format!(
                    "at most {SUBSCRIPTIONS_ENABLED_CAP} enabled subscriptions"
                )));
            }
        }

        let mut types = Vec::new();
        for t in event_types {
            if !types.contains(t) {
                types.push(*t);
            }
        }
        let subscription_id = mint_id("sub");
        let sub = Subscription {
            subscription_id: subscription_id.clone(),
            target_url: target_url.to_string(),
            event_types: types,
            is_enabled,
            created_at: now,
            secret,
        };
        let view = subscription_view(&sub);
        self.subscriptions.insert(subscription_id.clone(), sub);
        self.subscription_order.push(subscription_id);
        Ok(view)
    }

    pub fn subscription_views(&self) -> Vec<SubscriptionView> {
        self.subscription_order
            .iter()
            .filter_map(|id| self.subscriptions.get(id))
            .map(subscription_view)
            .collect()
    }

    /// Fans queued events out into PENDING deliveries and returns the work
    /// list. When an event would push past the per-dispatch delivery cap, it
    /// and all remaining events go back to the queue front untouched.
    pub fn drain_outbox(&mut self, cfg: &Config, now: DateTime<Utc>) -> Vec<DeliveryJob> {
        let cap = cfg.webhooks.max_deliveries_per_dispatch;
        let mut created = 0usize;
        let mut popped = 0usize;
        let mut requeue = Vec::new();

        while popped < DRAIN_BATCH {
            let Some(event) = self.outbox.pop_front() else { break };
            popped += 1;

            let targets: Vec<String> = self
                .subscription_order
                .iter()
                .filter(|id| {
                    self.subscriptions
                        .get(*id)
                        .map(|s| s.is_enabled && s.event_types.contains(&event.event_type))
                        .unwrap_or(false)
                })
                .filter(|id| {
                    !self
                        .delivery_keys
                        .contains(&(event.event_id.clone(), (*id).clone()))
                })
                .cloned()
                .collect();

            if created + targets.len() > cap {
                // atomic requeue: this event and everything after it wait
                requeue.push(event);
                requeue.extend(self.outbox.drain(..));
                break;
            }

            for sub_id in targets {
                let Some(sub) = self.subscriptions.get(&sub_id) else { continue };
                let delivery_id = mint_id("dlv");
                self.delivery_keys
                    .insert((event.event_id.clone(), sub_id.clone()));
                self.deliveries.push(Delivery {
                    delivery_id,
                    event_id: event.event_id.clone(),
                    event_type: event.event_type,
                    subscription_id: sub_id.clone(),
                    target_url: sub.target_url.clone(),
                    delivery_status: DeliveryStatus::Pending,
                    attempts: 0,
                    last_status_code: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    payload: event.clone(),
                });
                created += 1;
            }
        }
        for event in requeue.into_iter().rev() {
            self.outbox.push_front(event);
        }

        self.deliveries
            .iter()
            .filter(|d| d.delivery_status == DeliveryStatus::Pending)
            .filter_map(|d| {
                let secret = self
                    .subscriptions
                    .get(&d.subscription_id)
                    .and_then(|s| s.secret.clone());
                let value = serde_json::to_value(&d.payload).ok()?;
                let body = canonical_json(&value).ok()?;
                Some(DeliveryJob {
                    delivery_id: d.delivery_id.clone(),
                    target_url: d.target_url.clone(),
                    payload_body: body,
                    secret,
                })
            })
            .collect()
    }

    pub fn record_delivery_result(&mut self, result: &DeliveryResult, now: DateTime<Utc>) {
        if let Some(d) = self
            .deliveries
            .iter_mut()
            .find(|d| d.delivery_id == result.delivery_id)
        {
            d.delivery_status = result.status;
            d.attempts += result.attempts;
            d.last_status_code = result.last_status_code;
            d.last_error = result.last_error.clone();
            d.updated_at = now;
        }
    }

    /// Most recent deliveries first, capped for the public view.
    pub fn delivery_views(&self) -> Vec<DeliveryView> {
        self.deliveries
            .iter()
            .rev()
            .take(DELIVERIES_VIEW_CAP)
            .map(|d| DeliveryView {
                delivery_id: d.delivery_id.clone(),
                event_id: d.event_id.clone(),
                event_type: d.event_type,
                subscription_id: d.subscription_id.clone(),
                target_url: d.target_url.clone(),
                delivery_status: d.delivery_status,
                attempts: d.attempts,
                last_status_code: d.last_status_code,
                last_error: d.last_error.clone(),
                created_at: iso_z(d.created_at),
                updated_at: iso_z(d.updated_at),
            })
            .collect()
    }
}

fn subscription_view(sub: &Subscription) -> SubscriptionView {
    SubscriptionView {
        subscription_id: sub.subscription_id.clone(),
        target_url: sub.target_url.clone(),
        event_types: sub.event_types.clone(),
        is_enabled: sub.is_enabled,
        created_at: iso_z(sub.created_at),
    }
}

/// HTTP client for webhook deliveries: no redirects, no environment proxies.
pub fn delivery_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap_or_default()
}

/// Runs one delivery outside any lock: egress re-validation (including DNS),
/// then up to `retry_max_attempts` signed POSTs with fresh timestamps.
pub async fn deliver(client: &reqwest::Client, cfg: &Config, job: &DeliveryJob) -> DeliveryResult {
    let policy = egress_policy(cfg);
    let target = match validate_target_url(&job.target_url, &policy) {
        Ok(t) => t,
        Err(reason) => return egress_blocked(job, reason),
    };
    if target.literal_ip.is_none() {
        match tokio::net::lookup_host((target.host.as_str(), target.port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if let Some(reason) =
                        forbidden_ip_reason(addr.ip(), cfg.webhooks.allow_loopback_targets)
                    {
                        return egress_blocked(job, reason);
                    }
                }
            }
            Err(_) => return egress_blocked(job, "dns_failure"),
        }
    }

    let timeout = StdDuration::from_millis(cfg.webhooks.attempt_timeout_ms);
    let mut attempts = 0u32;
    let mut last_status_code = None;
    let mut last_error = None;
    while attempts < cfg.webhooks.retry_max_attempts {
        attempts += 1;
        let ts = Utc::now().timestamp();
        let mut req = client
            .post(job.target_url.clone())
            .header("Content-Type", "application/json")
            .header("X-JoyGate-Timestamp", ts.to_string())
            .timeout(timeout)
            .body(job.payload_body.clone());
        if let Some(secret) = &job.secret {
            req = req.header(
                "X-JoyGate-Signature",
                webhook_signature(secret, ts, &job.payload_body),
            );
        }
        match req.send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                last_status_code = Some(code);
                if resp.status().is_success() {
                    return DeliveryResult {
                        delivery_id: job.delivery_id.clone(),
                        status: DeliveryStatus::Delivered,
                        attempts,
                        last_status_code,
                        last_error: None,
                    };
                }
                last_error = Some(format!("http_{code}"));
            }
            Err(err) if err.is_timeout() => {
                last_error = Some("timeout".to_string());
            }
            Err(_) => {
                last_error = Some("connect_error".to_string());
            }
        }
    }
    tracing::warn!(
        delivery_id = %job.delivery_id,
        attempts,
        error = last_error.as_deref().unwrap_or("unknown"),
        "webhook delivery failed"
    );
    DeliveryResult {
        delivery_id: job.delivery_id.clone(),
        status: DeliveryStatus::Failed,
        attempts,
        last_status_code,
        last_error,
    }
}

fn egress_blocked(job: &DeliveryJob, reason: &str) -> DeliveryResult {
    tracing::warn!(delivery_id = %job.delivery_id, reason, "webhook delivery blocked by egress policy");
    DeliveryResult {
        delivery_id: job.delivery_id.clone(),
        status: DeliveryStatus::Failed,
        attempts: 0,
        last_status_code: None,
        last_error: Some(format!("egress_blocked:{reason}")),
    }
}
