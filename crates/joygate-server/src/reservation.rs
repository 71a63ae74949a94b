//! Hold reservation: per-actor quota, per-charger exclusivity, TTL expiry and
//! proactive congestion detection on repeated 409s.

use chrono::{DateTime, Duration, Utc};
use joygate_config::Config;
use joygate_contracts::{DecisionBasis, DecisionType, SlotState, WebhookEventType};
use joygate_kernel::{iso_z, mint_id};
use serde_json::json;

use crate::error::ApiError;
use crate::store::{CongestionHit, Hold, Store};

impl Store {
    /// Drops every hold with `expires_at <= now` and releases its slot.
    /// Both indexes are purged together so invariant checks at the end of any
    /// operation never observe a dangling side.
    pub fn purge_expired_holds(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .holds
            .values()
            .filter(|h| h.expires_at <= now)
            .map(|h| h.hold_id.clone())
            .collect();
        for hold_id in expired {
            if let Some(hold) = self.holds.remove(&hold_id) {
                self.holds_by_joykey.remove(&hold.joykey);
                if let Some(slot) = self.chargers.get_mut(&hold.charger_id) {
                    if slot.hold_id.as_deref() == Some(hold.hold_id.as_str()) {
                        slot.slot_state = SlotState::Free;
                        slot.hold_id = None;
                        slot.joykey = None;
                    }
                }
                self.emit_event(
                    WebhookEventType::HoldExpired,
                    "hold",
                    &hold.hold_id,
                    json!({
                        "hold_id": hold.hold_id,
                        "charger_id": hold.charger_id,
                        "joykey": hold.joykey,
                    }),
                    now,
                );
            }
        }
    }

    pub fn reserve(
        &mut self,
        cfg: &Config,
        resource_id: &str,
        joykey: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, u64), ApiError> {
        self.purge_expired_holds(now);

        if let Some(hold_id) = self.holds_by_joykey.get(joykey).cloned() {
            if self.holds.contains_key(&hold_id) {
                return Err(ApiError::Quota(format!(
                    "joykey {joykey} already owns a live hold"
                )));
            }
            // stale mapping: the hold itself is gone
            self.holds_by_joykey.remove(joykey);
        }

        let available = self
            .chargers
            .get(resource_id)
            .map(|slot| slot.slot_state == SlotState::Free)
            .unwrap_or(false);
        if !available {
            self.record_busy_hit(cfg, resource_id, joykey, now);
            return Err(ApiError::resource_busy(format!(
                "charger {resource_id} is not available"
            )));
        }

        let hold_id = mint_id("hold");
        let ttl = cfg.reservation.hold_ttl_seconds;
        let expires_at = now + Duration::seconds(ttl as i64);
        let slot = self
            .chargers
            .get_mut(resource_id)
            .ok_or_else(|| ApiError::resource_busy(format!("charger {resource_id} is not available")))?;
        slot.slot_state = SlotState::Held;
        slot.hold_id = Some(hold_id.clone());
        slot.joykey = Some(joykey.to_string());
        self.holds.insert(
            hold_id.clone(),
            Hold {
                hold_id: hold_id.clone(),
                charger_id: resource_id.to_string(),
                joykey: joykey.to_string(),
                expires_at,
            },
        );
        self.holds_by_joykey.insert(joykey.to_string(), hold_id.clone());

        self.emit_event(
            WebhookEventType::HoldCreated,
            "hold",
            &hold_id,
            json!({
                "hold_id": hold_id,
                "charger_id": resource_id,
                "joykey": joykey,
                "expires_at": iso_z(expires_at),
            }),
            now,
        );
        Ok((hold_id, ttl))
    }

    /// No-op unless both ids match a live hold.
    pub fn start_charging(&mut self, hold_id: &str, charger_id: &str, now: DateTime<Utc>) -> bool {
        self.purge_expired_holds(now);
        let matches = self
            .holds
            .get(hold_id)
            .map(|h| h.charger_id == charger_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(slot) = self.chargers.get_mut(charger_id) {
            slot.slot_state = SlotState::Charging;
        }
        true
    }

    /// Releases both the hold and the slot; no-op on mismatch.
    pub fn stop_charging(&mut self, hold_id: &str, charger_id: &str, now: DateTime<Utc>) -> bool {
        self.purge_expired_holds(now);
        let matches = self
            .holds
            .get(hold_id)
            .map(|h| h.charger_id == charger_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(hold) = self.holds.remove(hold_id) {
            self.holds_by_joykey.remove(&hold.joykey);
        }
        if let Some(slot) = self.chargers.get_mut(charger_id) {
            slot.slot_state = SlotState::Free;
            slot.hold_id = None;
            slot.joykey = None;
        }
        true
    }

    /// Appends a 409 hit, prunes the window, and when enough distinct joykeys
    /// have piled up on the charger suggests delaying each of them. One
    /// suggestion per (charger, joykey, window bucket).
    fn record_busy_hit(&mut self, cfg: &Config, charger_id: &str, joykey: &str, now: DateTime<Utc>) {
        let window = cfg.reservation.congestion_window_seconds;
        let cutoff = now - Duration::seconds(window as i64);
        let hits = self.congestion.entry(charger_id.to_string()).or_default();
        hits.push(CongestionHit {
            joykey: joykey.to_string(),
            at: now,
        });
        hits.retain(|h| h.at > cutoff);

        let mut distinct: Vec<String> = Vec::new();
        for hit in hits.iter() {
            if !distinct.contains(&hit.joykey) {
                distinct.push(hit.joykey.clone());
            }
        }
        if distinct.len() < cfg.reservation.congestion_distinct_joykeys {
            return;
        }

        let bucket = now.timestamp().div_euclid(window.max(1) as i64);
        for jk in distinct {
            let key = (charger_id.to_string(), jk.clone(), bucket);
            if self.congestion_emitted.contains(&key) {
                continue;
            }
            self.congestion_emitted.insert(key);
            let summary = format!(
                "proactive congestion: charger_id={charger_id}; joykey={jk}; \
                 delay_charging_seconds={window}"
            );
            self.append_decision(
                DecisionType::PolicySuggested,
                DecisionBasis::Policy,
                vec![charger_id.to_string(), jk],
                &summary,
                now,
            );
        }
    }
}
