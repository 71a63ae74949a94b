use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse {0} failed: {1}")]
    Parse(&'static str, String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayMode {
    Demo,
    Calendar,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiProviderKind {
    Mock,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub sandbox: Sandbox,
    pub rate_limit: RateLimit,
    pub reservation: Reservation,
    pub incidents: Incidents,
    pub witness: Witness,
    pub hazard: Hazard,
    pub ai: Ai,
    pub webhooks: Webhooks,
    pub demo: Demo,
    pub admin: Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    pub lock_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub max_sandboxes: usize,
    pub idle_ttl_seconds: u64,
    pub header_mode: bool,
    pub header_secret: Option<String>,
    pub header_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub per_sandbox_per_min: u32,
    pub per_ip_per_min: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub hold_ttl_seconds: u64,
    pub congestion_window_seconds: u64,
    pub congestion_distinct_joykeys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incidents {
    pub max_incidents: usize,
    pub ttl_resolved_low_seconds: u64,
    pub ttl_resolved_high_seconds: u64,
    pub witness_sla_timeout_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Witness {
    pub vendor_decay_gamma: f64,
    pub score_required: f64,
    pub score_required_single_vendor: f64,
    pub min_distinct_vendors: usize,
    pub min_distinct_vendors_risky: usize,
    pub score_required_risky: f64,
    pub min_margin_risky: f64,
    pub min_certified_support_risky: usize,
    pub certified_points_threshold: f64,
    /// joykey -> vendor pairs seeded into every fresh sandbox.
    pub allowlist: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hazard {
    pub recheck_interval_minutes: u64,
    pub segment_witness_sla_timeout_minutes: u64,
    pub segment_witness_votes_required: u32,
    pub soft_escalate_after_rechecks: u32,
    pub freshness_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ai {
    pub provider: AiProviderKind,
    pub gemini_api_key: Option<String>,
    pub daily_budget_calls: u32,
    pub budget_day_seconds: u64,
    pub job_lease_seconds: u64,
    pub job_dedup_seconds: u64,
    pub job_retention_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhooks {
    pub retry_max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub max_deliveries_per_dispatch: usize,
    pub allow_http_targets: bool,
    pub allow_loopback_targets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demo {
    pub minute_seconds: u64,
    pub day_mode: DayMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admin {
    pub god_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: Server {
                listen_addr: "127.0.0.1:8080".to_string(),
                lock_file: "./joygate.lock".to_string(),
            },
            sandbox: Sandbox {
                max_sandboxes: 64,
                idle_ttl_seconds: 1800,
                header_mode: false,
                header_secret: None,
                header_ttl_seconds: 300,
            },
            rate_limit: RateLimit {
                per_sandbox_per_min: 240,
                per_ip_per_min: 480,
            },
            reservation: Reservation {
                hold_ttl_seconds: 180,
                congestion_window_seconds: 120,
                congestion_distinct_joykeys: 3,
            },
            incidents: Incidents {
                max_incidents: 500,
                ttl_resolved_low_seconds: 600,
                ttl_resolved_high_seconds: 3600,
                witness_sla_timeout_minutes: 10,
            },
            witness: Witness {
                vendor_decay_gamma: 0.5,
                score_required: 2.0,
                score_required_single_vendor: 3.0,
                min_distinct_vendors: 2,
                min_distinct_vendors_risky: 3,
                score_required_risky: 3.0,
                min_margin_risky: 1.0,
                min_certified_support_risky: 1,
                certified_points_threshold: 80.0,
                allowlist: vec![
                    ("w1".to_string(), "acme".to_string()),
                    ("w2".to_string(), "bolt".to_string()),
                    ("w3".to_string(), "acme".to_string()),
                    ("w4".to_string(), "crux".to_string()),
                ],
            },
            hazard: Hazard {
                recheck_interval_minutes: 5,
                segment_witness_sla_timeout_minutes: 10,
                segment_witness_votes_required: 2,
                soft_escalate_after_rechecks: 2,
                freshness_window_seconds: 300,
            },
            ai: Ai {
                provider: AiProviderKind::Mock,
                gemini_api_key: None,
                daily_budget_calls: 50,
                budget_day_seconds: 86_400,
                job_lease_seconds: 30,
                job_dedup_seconds: 60,
                job_retention_seconds: 3600,
            },
            webhooks: Webhooks {
                retry_max_attempts: 3,
                attempt_timeout_ms: 3000,
                max_deliveries_per_dispatch: 50,
                allow_http_targets: false,
                allow_loopback_targets: false,
            },
            demo: Demo {
                minute_seconds: 60,
                day_mode: DayMode::Calendar,
            },
            admin: Admin { god_token: None },
        }
    }
}

impl Config {
    /// Loads the whole configuration once from process environment.
    /// There is no runtime reload.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut cfg = Config::default();

        if let Some(v) = env_string("JOYGATE_LISTEN_ADDR") {
            cfg.server.listen_addr = v;
        }
        if let Some(v) = env_string("JOYGATE_LOCK_FILE") {
            cfg.server.lock_file = v;
        }

        env_usize("JOYGATE_MAX_SANDBOXES", &mut cfg.sandbox.max_sandboxes)?;
        env_u64("JOYGATE_SANDBOX_IDLE_TTL_SECONDS", &mut cfg.sandbox.idle_ttl_seconds)?;
        env_bool("JOYGATE_SANDBOX_HEADER_MODE", &mut cfg.sandbox.header_mode)?;
        cfg.sandbox.header_secret = env_string("JOYGATE_SANDBOX_HEADER_SECRET");
        env_u64("JOYGATE_SANDBOX_HEADER_TTL_SECONDS", &mut cfg.sandbox.header_ttl_seconds)?;

        env_u32("JOYGATE_RATE_LIMIT_PER_SANDBOX_PER_MIN", &mut cfg.rate_limit.per_sandbox_per_min)?;
        env_u32("JOYGATE_RATE_LIMIT_PER_IP_PER_MIN", &mut cfg.rate_limit.per_ip_per_min)?;

        env_u64("JOYGATE_HOLD_TTL_SECONDS", &mut cfg.reservation.hold_ttl_seconds)?;
        env_u64("JOYGATE_CONGESTION_WINDOW_SECONDS", &mut cfg.reservation.congestion_window_seconds)?;
        env_usize(
            "JOYGATE_CONGESTION_DISTINCT_JOYKEYS",
            &mut cfg.reservation.congestion_distinct_joykeys,
        )?;

        env_usize("JOYGATE_MAX_INCIDENTS", &mut cfg.incidents.max_incidents)?;
        env_u64("JOYGATE_TTL_RESOLVED_LOW_SECONDS", &mut cfg.incidents.ttl_resolved_low_seconds)?;
        env_u64("JOYGATE_TTL_RESOLVED_HIGH_SECONDS", &mut cfg.incidents.ttl_resolved_high_seconds)?;
        env_u64(
            "JOYGATE_WITNESS_SLA_TIMEOUT_MINUTES",
            &mut cfg.incidents.witness_sla_timeout_minutes,
        )?;

        env_f64("JOYGATE_WITNESS_VENDOR_DECAY_GAMMA", &mut cfg.witness.vendor_decay_gamma)?;
        env_f64("JOYGATE_WITNESS_SCORE_REQUIRED", &mut cfg.witness.score_required)?;
        env_f64(
            "JOYGATE_WITNESS_SCORE_REQUIRED_SINGLE_VENDOR",
            &mut cfg.witness.score_required_single_vendor,
        )?;
        env_usize("JOYGATE_WITNESS_MIN_DISTINCT_VENDORS", &mut cfg.witness.min_distinct_vendors)?;
        env_usize(
            "JOYGATE_WITNESS_MIN_DISTINCT_VENDORS_RISKY",
            &mut cfg.witness.min_distinct_vendors_risky,
        )?;
        env_f64("JOYGATE_WITNESS_SCORE_REQUIRED_RISKY", &mut cfg.witness.score_required_risky)?;
        env_f64("JOYGATE_WITNESS_MIN_MARGIN_RISKY", &mut cfg.witness.min_margin_risky)?;
        env_usize(
            "JOYGATE_WITNESS_MIN_CERTIFIED_SUPPORT_RISKY",
            &mut cfg.witness.min_certified_support_risky,
        )?;
        env_f64(
            "JOYGATE_WITNESS_CERTIFIED_POINTS_THRESHOLD",
            &mut cfg.witness.certified_points_threshold,
        )?;
        if let Some(raw) = env_string("JOYGATE_WITNESS_ALLOWLIST") {
            cfg.witness.allowlist = parse_allowlist(&raw)?;
        }

        env_u64("JOYGATE_HAZARD_RECHECK_INTERVAL_MINUTES", &mut cfg.hazard.recheck_interval_minutes)?;
        env_u64(
            "JOYGATE_SEGMENT_WITNESS_SLA_TIMEOUT_MINUTES",
            &mut cfg.hazard.segment_witness_sla_timeout_minutes,
        )?;
        env_u32(
            "JOYGATE_SEGMENT_WITNESS_VOTES_REQUIRED",
            &mut cfg.hazard.segment_witness_votes_required,
        )?;
        env_u32(
            "JOYGATE_SOFT_HAZARD_ESCALATE_AFTER_RECHECKS",
            &mut cfg.hazard.soft_escalate_after_rechecks,
        )?;
        env_u64(
            "JOYGATE_SEGMENT_FRESHNESS_WINDOW_SECONDS",
            &mut cfg.hazard.freshness_window_seconds,
        )?;

        if let Some(v) = env_string("JOYGATE_AI_PROVIDER") {
            cfg.ai.provider = match v.as_str() {
                "mock" => AiProviderKind::Mock,
                "gemini" => AiProviderKind::Gemini,
                other => {
                    return Err(ConfigError::Parse(
                        "JOYGATE_AI_PROVIDER",
                        format!("unknown provider {other:?}; supported: mock, gemini"),
                    ))
                }
            };
        }
        cfg.ai.gemini_api_key = env_string("JOYGATE_GEMINI_API_KEY");
        env_u32("JOYGATE_AI_DAILY_BUDGET_CALLS", &mut cfg.ai.daily_budget_calls)?;
        env_u64("JOYGATE_AI_BUDGET_DAY_SECONDS", &mut cfg.ai.budget_day_seconds)?;
        env_u64("JOYGATE_AI_JOB_LEASE_SECONDS", &mut cfg.ai.job_lease_seconds)?;
        env_u64("JOYGATE_AI_JOB_DEDUP_SECONDS", &mut cfg.ai.job_dedup_seconds)?;
        env_u64("JOYGATE_AI_JOB_RETENTION_SECONDS", &mut cfg.ai.job_retention_seconds)?;

        env_u32("JOYGATE_WEBHOOK_RETRY_MAX_ATTEMPTS", &mut cfg.webhooks.retry_max_attempts)?;
        env_u64("JOYGATE_WEBHOOK_ATTEMPT_TIMEOUT_MS", &mut cfg.webhooks.attempt_timeout_ms)?;
        env_usize(
            "JOYGATE_WEBHOOK_MAX_DELIVERIES_PER_DISPATCH",
            &mut cfg.webhooks.max_deliveries_per_dispatch,
        )?;
        env_bool("JOYGATE_WEBHOOK_ALLOW_HTTP_TARGETS", &mut cfg.webhooks.allow_http_targets)?;
        env_bool(
            "JOYGATE_WEBHOOK_ALLOW_LOOPBACK_TARGETS",
            &mut cfg.webhooks.allow_loopback_targets,
        )?;

        env_u64("JOYGATE_DEMO_MINUTE_SECONDS", &mut cfg.demo.minute_seconds)?;
        if let Some(v) = env_string("JOYGATE_DAY_MODE") {
            cfg.demo.day_mode = match v.as_str() {
                "DEMO" => DayMode::Demo,
                "CALENDAR" => DayMode::Calendar,
                other => {
                    return Err(ConfigError::Parse(
                        "JOYGATE_DAY_MODE",
                        format!("unknown day mode {other:?}; supported: DEMO, CALENDAR"),
                    ))
                }
            };
        }
        cfg.admin.god_token = env_string("JOYGATE_ADMIN_TOKEN");

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.header_mode && self.sandbox.header_secret.is_none() {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_SANDBOX_HEADER_SECRET is required when header mode is on".to_string(),
            ));
        }
        if self.ai.provider == AiProviderKind::Gemini && self.ai.gemini_api_key.is_none() {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_GEMINI_API_KEY is required when JOYGATE_AI_PROVIDER=gemini".to_string(),
            ));
        }
        if self.sandbox.max_sandboxes == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_MAX_SANDBOXES must be >= 1".to_string(),
            ));
        }
        if self.demo.minute_seconds == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_DEMO_MINUTE_SECONDS must be >= 1".to_string(),
            ));
        }
        if self.webhooks.retry_max_attempts == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_WEBHOOK_RETRY_MAX_ATTEMPTS must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.witness.vendor_decay_gamma) {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_WITNESS_VENDOR_DECAY_GAMMA must be within [0, 1]".to_string(),
            ));
        }
        if self.ai.budget_day_seconds == 0 {
            return Err(ConfigError::UnsupportedConfig(
                "JOYGATE_AI_BUDGET_DAY_SECONDS must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// A configured "minute" in seconds, demo-scaled, never below 1 s.
    pub fn scaled_minutes_secs(&self, minutes: u64) -> u64 {
        (minutes * self.demo.minute_seconds).max(1)
    }

    /// AI lease seconds with the documented floor of 1.
    pub fn lease_seconds(&self) -> u64 {
        self.ai.job_lease_seconds.max(1)
    }

    /// Read-only policy map served by `GET /v1/policy`. No secrets.
    pub fn policy_map(&self) -> serde_json::Value {
        json!({
            "hold_ttl_seconds": self.reservation.hold_ttl_seconds,
            "congestion_window_seconds": self.reservation.congestion_window_seconds,
            "congestion_distinct_joykeys": self.reservation.congestion_distinct_joykeys,
            "max_incidents": self.incidents.max_incidents,
            "ttl_resolved_low_seconds": self.incidents.ttl_resolved_low_seconds,
            "ttl_resolved_high_seconds": self.incidents.ttl_resolved_high_seconds,
            "witness_sla_timeout_minutes": self.incidents.witness_sla_timeout_minutes,
            "witness_vendor_decay_gamma": self.witness.vendor_decay_gamma,
            "witness_score_required": self.witness.score_required,
            "witness_score_required_single_vendor": self.witness.score_required_single_vendor,
            "witness_min_distinct_vendors": self.witness.min_distinct_vendors,
            "witness_min_distinct_vendors_risky": self.witness.min_distinct_vendors_risky,
            "witness_score_required_risky": self.witness.score_required_risky,
            "witness_min_margin_risky": self.witness.min_margin_risky,
            "witness_min_certified_support_risky": self.witness.min_certified_support_risky,
            "witness_certified_points_threshold": self.witness.certified_points_threshold,
            "hazard_recheck_interval_minutes": self.hazard.recheck_interval_minutes,
            "segment_witness_sla_timeout_minutes": self.hazard.segment_witness_sla_timeout_minutes,
            "segment_witness_votes_required": self.hazard.segment_witness_votes_required,
            "soft_hazard_escalate_after_rechecks": self.hazard.soft_escalate_after_rechecks,
            "segment_freshness_window_seconds": self.hazard.freshness_window_seconds,
            "ai_daily_budget_calls": self.ai.daily_budget_calls,
            "ai_budget_day_seconds": self.ai.budget_day_seconds,
            "ai_job_lease_seconds": self.lease_seconds(),
            "ai_job_dedup_seconds": self.ai.job_dedup_seconds,
            "ai_job_retention_seconds": self.ai.job_retention_seconds,
            "webhook_retry_max_attempts": self.webhooks.retry_max_attempts,
            "webhook_max_deliveries_per_dispatch": self.webhooks.max_deliveries_per_dispatch,
            "demo_minute_seconds": self.demo.minute_seconds,
            "day_mode": self.demo.day_mode,
        })
    }
}

fn env_string(name: &'static str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_u64(name: &'static str, slot: &mut u64) -> Result<(), ConfigError> {
    if let Some(v) = env_string(name) {
        *slot = v.parse().map_err(|e: std::num::ParseIntError| ConfigError::Parse(name, e.to_string()))?;
    }
    Ok(())
}

fn env_u32(name: &'static str, slot: &mut u32) -> Result<(), ConfigError> {
    if let Some(v) = env_string(name) {
        *slot = v.parse().map_err(|e: std::num::ParseIntError| ConfigError::Parse(name, e.to_string()))?;
    }
    Ok(())
}

fn env_usize(name: &'static str, slot: &mut usize) -> Result<(), ConfigError> {
    if let Some(v) = env_string(name) {
        *slot = v.parse().map_err(|e: std::num::ParseIntError| ConfigError::Parse(name, e.to_string()))?;
    }
    Ok(())
}

fn env_f64(name: &'static str, slot: &mut f64) -> Result<(), ConfigError> {
    if let Some(v) = env_string(name) {
        *slot = v.parse().map_err(|e: std::num::ParseFloatError| ConfigError::Parse(name, e.to_string()))?;
    }
    Ok(())
}

fn env_bool(name: &'static str, slot: &mut bool) -> Result<(), ConfigError> {
    if let Some(v) = env_string(name) {
        *slot = match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(ConfigError::Parse(name, format!("not a boolean: {other:?}")));
            }
        };
    }
    Ok(())
}

fn parse_allowlist(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (joykey, vendor) = entry.split_once(':').ok_or_else(|| {
            ConfigError::Parse(
                "JOYGATE_WITNESS_ALLOWLIST",
                format!("entry {entry:?} must be <joykey>:<vendor>"),
            )
        })?;
        if joykey.trim().is_empty() || vendor.trim().is_empty() {
            return Err(ConfigError::Parse(
                "JOYGATE_WITNESS_ALLOWLIST",
                format!("entry {entry:?} has an empty joykey or vendor"),
            ));
        }
        out.push((joykey.trim().to_string(), vendor.trim().to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults should be valid");
    }

    #[test]
    fn header_mode_without_secret_is_rejected() {
        let mut cfg = Config::default();
        cfg.sandbox.header_mode = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::UnsupportedConfig(_))));
        cfg.sandbox.header_secret = Some("shh".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gemini_requires_api_key() {
        let mut cfg = Config::default();
        cfg.ai.provider = AiProviderKind::Gemini;
        assert!(cfg.validate().is_err());
        cfg.ai.gemini_api_key = Some("k".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn demo_scaling_has_a_floor_of_one_second() {
        let mut cfg = Config::default();
        cfg.demo.minute_seconds = 5;
        assert_eq!(cfg.scaled_minutes_secs(10), 50);
        cfg.demo.minute_seconds = 1;
        assert_eq!(cfg.scaled_minutes_secs(0), 1);
    }

    #[test]
    fn allowlist_parsing() {
        let list = parse_allowlist("w1:acme, w2:bolt ,").unwrap();
        assert_eq!(
            list,
            vec![
                ("w1".to_string(), "acme".to_string()),
                ("w2".to_string(), "bolt".to_string())
            ]
        );
        assert!(parse_allowlist("w1").is_err());
        assert!(parse_allowlist("w1:").is_err());
    }

    #[test]
    fn policy_map_carries_no_secret_keys() {
        let mut cfg = Config::default();
        cfg.admin.god_token = Some("top-secret".to_string());
        cfg.sandbox.header_secret = Some("also-secret".to_string());
        let text = cfg.policy_map().to_string();
        assert!(!text.contains("secret"));
        assert!(!text.contains("token"));
    }
}
