//! Read-only today roll-up. "Today" is either the UTC calendar date or, in
//! demo mode, the current demo-day bucket since boot.

use chrono::{DateTime, Duration, Utc};
use joygate_config::{Config, DayMode};
use joygate_contracts::{AiJobStatus, DashboardToday, HazardStatus, IncidentStatus};

use crate::store::Store;

impl Store {
    pub fn dashboard_today(&self, cfg: &Config, now: DateTime<Utc>) -> DashboardToday {
        let (day_key, day_start) = match cfg.demo.day_mode {
            DayMode::Calendar => {
                let date = now.date_naive();
                let start = date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(now);
                (date.format("%Y-%m-%d").to_string(), start)
            }
            DayMode::Demo => {
                let day_len = cfg.ai.budget_day_seconds as i64;
                let elapsed = (now - self.boot_at).num_seconds().max(0);
                let idx = elapsed / day_len;
                let start = self.boot_at + Duration::seconds(idx * day_len);
                (format!("demo_{idx}"), start)
            }
        };

        let in_today = |t: DateTime<Utc>| t >= day_start && t <= now;

        DashboardToday {
            day_mode: match cfg.demo.day_mode {
                DayMode::Demo => "DEMO".to_string(),
                DayMode::Calendar => "CALENDAR".to_string(),
            },
            day_key,
            holds_active: self.holds.len(),
            chargers_total: self.chargers.len(),
            incidents_open: self
                .incidents
                .values()
                .filter(|i| !i.incident_status.is_terminal())
                .count(),
            incidents_resolved_today: self
                .incidents
                .values()
                .filter(|i| {
                    i.incident_status == IncidentStatus::Resolved && in_today(i.status_updated_at)
                })
                .count(),
            hazards_soft: self
                .hazards
                .values()
                .filter(|h| h.hazard_status == HazardStatus::SoftBlocked)
                .count(),
            hazards_hard: self
                .hazards
                .values()
                .filter(|h| h.hazard_status == HazardStatus::HardBlocked)
                .count(),
            ai_jobs_completed_today: self
                .ai_jobs
                .values()
                .filter(|j| {
                    j.ai_job_status == AiJobStatus::Completed
                        && j.completed_at.map(&in_today).unwrap_or(false)
                })
                .count(),
            webhook_deliveries_today: self
                .deliveries
                .iter()
                .filter(|d| in_today(d.updated_at))
                .count(),
            decisions_total: self.decisions.len(),
        }
    }
}
