//! AI job queue: idempotent creation, lease-based tick scheduling with a
//! daily vision budget, and deterministic ledger summaries at completion.

use chrono::{DateTime, Duration, Utc};
use joygate_config::Config;
use joygate_contracts::{
    AiJobAccepted, AiJobItem, AiJobStatus, AiJobType, Audience, DecisionBasis, DecisionType,
    DispatchReasonCode, IncidentItem, InsightType, ModelTier, ObstacleType, WebhookEventType,
};
use joygate_kernel::{mint_id, sha256_hex};
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;
use crate::incident::{incident_item, merge_evidence_refs};
use crate::provider::AuditOutcome;
use crate::store::{AiJob, JobPayload, RenderSnapshot, Store};

/// Work collected under the lock for one tick; everything a worker needs to
/// run phase 2 without touching the store.
#[derive(Debug)]
pub enum TickTask {
    VisionAudit {
        ai_job_id: String,
        ai_report_id: String,
        lease_until: DateTime<Utc>,
        use_budget: bool,
        render: RenderSnapshot,
        incident: Option<IncidentItem>,
    },
    /// DISPATCH_EXPLAIN and POLICY_SUGGEST synthesize their decision at
    /// write-back; no external call happens in between.
    Synth {
        ai_job_id: String,
        lease_until: DateTime<Utc>,
    },
}

fn wire<T: Serialize>(v: &T) -> String {
    serde_json::to_value(v)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl Store {
    fn gc_ai_jobs(&mut self, cfg: &Config, now: DateTime<Utc>) {
        let retention = Duration::seconds(cfg.ai.job_retention_seconds as i64);
        let dead: Vec<String> = self
            .ai_jobs
            .values()
            .filter(|job| {
                job.ai_job_status.is_terminal()
                    && job
                        .completed_at
                        .map(|t| t + retention <= now)
                        .unwrap_or(false)
            })
            .map(|job| job.ai_job_id.clone())
            .collect();
        for id in dead {
            if let Some(job) = self.ai_jobs.remove(&id) {
                self.ai_jobs_by_report.remove(&job.ai_report_id);
            }
            self.ai_queue.retain(|x| *x != id);
            self.ai_job_order.retain(|x| *x != id);
        }
    }

    fn accept_job(
        &mut self,
        ai_job_type: AiJobType,
        incident_id: Option<String>,
        model_tier: ModelTier,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> AiJobAccepted {
        let ai_job_id = mint_id("job");
        let ai_report_id = mint_id("airpt");
        self.ai_jobs.insert(
            ai_job_id.clone(),
            AiJob {
                ai_job_id: ai_job_id.clone(),
                ai_report_id: ai_report_id.clone(),
                ai_job_type,
                ai_job_status: AiJobStatus::Accepted,
                incident_id,
                model_tier,
                created_at: now,
                completed_at: None,
                lease_until: None,
                payload,
            },
        );
        self.ai_jobs_by_report
            .insert(ai_report_id.clone(), ai_job_id.clone());
        self.ai_queue.push_back(ai_job_id.clone());
        self.ai_job_order.push_back(ai_job_id.clone());
        self.emit_job_status(&ai_job_id, now);
        AiJobAccepted {
            ai_report_id,
            status: AiJobStatus::Accepted,
        }
    }

    /// VISION_AUDIT create with the dedup rule: an active job wins, then a
    /// recently-finished one, then a fresh job with a frozen world snapshot.
    pub fn create_vision_audit(
        &mut self,
        cfg: &Config,
        incident_id: &str,
        snapshot_ref: Option<String>,
        evidence_refs: &[String],
        model_tier: Option<ModelTier>,
        now: DateTime<Utc>,
    ) -> Result<AiJobAccepted, ApiError> {
        self.gc_ai_jobs(cfg, now);
        if !self.incidents.contains_key(incident_id) {
            return Err(ApiError::NotFound(format!("unknown incident {incident_id}")));
        }

        if let Some(existing) = self.dedup_vision_job(cfg, incident_id, now) {
            return Ok(existing);
        }

        if let Some(inc) = self.incidents.get_mut(incident_id) {
            merge_evidence_refs(&mut inc.evidence_refs, evidence_refs);
            if inc.snapshot_ref.is_none() {
                inc.snapshot_ref = snapshot_ref;
            }
        }
        let render = self.world.clone();
        Ok(self.accept_job(
            AiJobType::VisionAudit,
            Some(incident_id.to_string()),
            model_tier.unwrap_or(ModelTier::Flash),
            JobPayload::VisionAudit {
                render_snapshot: render,
            },
            now,
        ))
    }

    fn dedup_vision_job(
        &self,
        cfg: &Config,
        incident_id: &str,
        now: DateTime<Utc>,
    ) -> Option<AiJobAccepted> {
        let dedup = Duration::seconds(cfg.ai.job_dedup_seconds as i64);
        let mut recent_terminal: Option<&AiJob> = None;
        for job in self.ai_jobs.values() {
            if job.ai_job_type != AiJobType::VisionAudit
                || job.incident_id.as_deref() != Some(incident_id)
            {
                continue;
            }
            match job.ai_job_status {
                AiJobStatus::Accepted | AiJobStatus::InProgress => {
                    return Some(AiJobAccepted {
                        ai_report_id: job.ai_report_id.clone(),
                        status: job.ai_job_status,
                    });
                }
                AiJobStatus::Completed | AiJobStatus::Failed => {
                    if job.completed_at.map(|t| t + dedup > now).unwrap_or(false)
                        && recent_terminal
                            .map(|best| job.completed_at > best.completed_at)
                            .unwrap_or(true)
                    {
                        recent_terminal = Some(job);
                    }
                }
            }
        }
        recent_terminal.map(|job| AiJobAccepted {
            ai_report_id: job.ai_report_id.clone(),
            status: job.ai_job_status,
        })
    }

    pub fn create_dispatch_explain(
        &mut self,
        cfg: &Config,
        hold_id: &str,
        audience: Audience,
        dispatch_reason_codes: Vec<DispatchReasonCode>,
        obstacle_type: Option<ObstacleType>,
        context_ref: Option<&str>,
        model_tier: Option<ModelTier>,
        now: DateTime<Utc>,
    ) -> AiJobAccepted {
        self.gc_ai_jobs(cfg, now);
        let charger_id = self.holds.get(hold_id).map(|h| h.charger_id.clone());
        let context_ref_hash = context_ref.map(|c| sha256_hex(c.as_bytes())[..12].to_string());
        self.accept_job(
            AiJobType::DispatchExplain,
            None,
            model_tier.unwrap_or(ModelTier::Flash),
            JobPayload::DispatchExplain {
                hold_id: hold_id.to_string(),
                audience,
                dispatch_reason_codes,
                obstacle_type: obstacle_type.unwrap_or(ObstacleType::Unknown),
                charger_id,
                context_ref_hash,
            },
            now,
        )
    }

    pub fn create_policy_suggest(
        &mut self,
        cfg: &Config,
        incident_id: Option<&str>,
        context_ref: Option<&str>,
        model_tier: Option<ModelTier>,
        now: DateTime<Utc>,
    ) -> AiJobAccepted {
        self.gc_ai_jobs(cfg, now);
        // only the digest is ever stored; the raw context_ref dies here
        let context_ref_sha256 = Some(sha256_hex(context_ref.unwrap_or_default().as_bytes()));
        self.accept_job(
            AiJobType::PolicySuggest,
            incident_id.map(str::to_string),
            model_tier.unwrap_or(ModelTier::Pro),
            JobPayload::PolicySuggest { context_ref_sha256 },
            now,
        )
    }

    /// Tick phase 1. Reclaims expired leases, then leases up to `max_jobs`
    /// queued jobs and hands back their tasks for the unlocked phase.
    pub fn tick_collect(
        &mut self,
        cfg: &Config,
        max_jobs: usize,
        now: DateTime<Utc>,
    ) -> Vec<TickTask> {
        self.gc_ai_jobs(cfg, now);

        let expired: Vec<String> = self
            .ai_jobs
            .values()
            .filter(|job| {
                job.ai_job_status == AiJobStatus::InProgress
                    && job.lease_until.map(|l| l < now).unwrap_or(true)
            })
            .map(|job| job.ai_job_id.clone())
            .collect();
        for id in expired {
            if let Some(job) = self.ai_jobs.get_mut(&id) {
                job.ai_job_status = AiJobStatus::Accepted;
                job.lease_until = None;
            }
            if !self.ai_queue.contains(&id) {
                self.ai_queue.push_back(id);
            }
        }

        let day_index =
            ((now - self.boot_at).num_seconds().max(0) as u64) / cfg.ai.budget_day_seconds;
        if day_index != self.ai_day_index {
            self.ai_day_index = day_index;
            self.ai_daily_calls_count = 0;
        }

        let lease_until = now + Duration::seconds(cfg.lease_seconds() as i64);
        let mut tasks = Vec::new();
        while tasks.len() < max_jobs {
            let Some(id) = self.ai_queue.pop_front() else { break };
            let Some(job) = self.ai_jobs.get_mut(&id) else { continue };
            if job.ai_job_status != AiJobStatus::Accepted {
                continue;
            }
            job.ai_job_status = AiJobStatus::InProgress;
            job.lease_until = Some(lease_until);
            match &job.payload {
                JobPayload::VisionAudit { render_snapshot } => {
                    let render = render_snapshot.clone();
                    let ai_report_id = job.ai_report_id.clone();
                    let incident_id = job.incident_id.clone();
                    let use_budget = if self.ai_daily_calls_count < cfg.ai.daily_budget_calls {
                        self.ai_daily_calls_count += 1;
                        true
                    } else {
                        false
                    };
                    let incident = incident_id
                        .as_deref()
                        .and_then(|iid| self.incidents.get(iid))
                        .map(incident_item);
                    tasks.push(TickTask::VisionAudit {
                        ai_job_id: id,
                        ai_report_id,
                        lease_until,
                        use_budget,
                        render,
                        incident,
                    });
                }
                JobPayload::DispatchExplain { .. } | JobPayload::PolicySuggest { .. } => {
                    tasks.push(TickTask::Synth {
                        ai_job_id: id,
                        lease_until,
                    });
                }
            }
        }
        tasks
    }

    /// Tick phase 3 for VISION_AUDIT. Returns true when the job completed.
    /// Stale write-backs (job reclaimed, lease changed) are dropped.
    pub fn finish_vision_audit(
        &mut self,
        job_id: &str,
        lease_until: DateTime<Utc>,
        result: Result<AuditOutcome, String>,
        now: DateTime<Utc>,
    ) -> bool {
        let (ai_report_id, incident_id) = match self.ai_jobs.get(job_id) {
            Some(job)
                if job.ai_job_status == AiJobStatus::InProgress
                    && job.lease_until == Some(lease_until) =>
            {
                (job.ai_report_id.clone(), job.incident_id.clone())
            }
            _ => return false,
        };

        let (status, outcome) = match result {
            Ok(outcome) => (AiJobStatus::Completed, outcome),
            Err(detail) => (
                AiJobStatus::Failed,
                AuditOutcome {
                    summary: format!("vision audit failed: {detail}"),
                    confidence: None,
                },
            ),
        };

        if let Some(iid) = incident_id.as_deref() {
            self.upsert_insight(
                iid,
                InsightType::VisionAuditRequested,
                Some(ai_report_id.clone()),
                format!("vision audit requested, ai_report_id={ai_report_id}"),
            );
            self.upsert_insight(
                iid,
                InsightType::VisionAuditResult,
                Some(ai_report_id.clone()),
                outcome.summary.clone(),
            );
            if status == AiJobStatus::Completed && outcome.confidence.is_some() {
                self.confirm_incident(iid, now);
            }
        }

        if let Some(job) = self.ai_jobs.get_mut(job_id) {
            job.ai_job_status = status;
            job.completed_at = Some(now);
            job.lease_until = None;
        }
        self.emit_job_status(job_id, now);
        status == AiJobStatus::Completed
    }

    /// Tick phase 3 for DISPATCH_EXPLAIN / POLICY_SUGGEST: one ledger
    /// decision, then COMPLETED.
    pub fn finish_synth_job(
        &mut self,
        job_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let job = match self.ai_jobs.get(job_id) {
            Some(job)
                if job.ai_job_status == AiJobStatus::InProgress
                    && job.lease_until == Some(lease_until) =>
            {
                job.clone()
            }
            _ => return false,
        };

        match &job.payload {
            JobPayload::DispatchExplain {
                hold_id,
                audience,
                dispatch_reason_codes,
                obstacle_type,
                charger_id,
                context_ref_hash,
            } => {
                let codes: Vec<&str> = dispatch_reason_codes.iter().map(|c| c.as_str()).collect();
                let mut summary = format!(
                    "hold_id={hold_id}; audience={}; dispatch_reason_codes={}; obstacle_type={}",
                    wire(audience),
                    codes.join(","),
                    wire(obstacle_type),
                );
                if let Some(c) = charger_id {
                    summary.push_str(&format!("; charger_id={c}"));
                }
                if let Some(i) = &job.incident_id {
                    summary.push_str(&format!("; incident_id={i}"));
                }
                if let Some(h) = context_ref_hash {
                    summary.push_str(&format!("; context_ref_hash={h}"));
                }
                self.append_decision(
                    DecisionType::RerouteSuggested,
                    DecisionBasis::Policy,
                    vec![job.ai_report_id.clone(), hold_id.clone()],
                    &summary,
                    now,
                );
            }
            JobPayload::PolicySuggest { context_ref_sha256 } => {
                let incident_id = job.incident_id.as_deref().unwrap_or("-");
                let digest = context_ref_sha256.as_deref().unwrap_or("");
                let mut summary =
                    format!("incident_id={incident_id}; context_ref_sha256={digest}");
                if !digest.is_empty() {
                    summary.push_str(&format!("; context_ref_hash={}", &digest[..12]));
                }
                if let Some(inc) = job.incident_id.as_deref().and_then(|i| self.incidents.get(i)) {
                    summary.push_str(&format!(
                        "; incident_status={}",
                        wire(&inc.incident_status)
                    ));
                }
                self.append_decision(
                    DecisionType::PolicySuggested,
                    DecisionBasis::Policy,
                    vec![job.ai_report_id.clone()],
                    &summary,
                    now,
                );
            }
            JobPayload::VisionAudit { .. } => return false,
        }

        if let Some(job) = self.ai_jobs.get_mut(job_id) {
            job.ai_job_status = AiJobStatus::Completed;
            job.completed_at = Some(now);
            job.lease_until = None;
        }
        self.emit_job_status(job_id, now);
        true
    }

    /// Admin confirmation of a POLICY_SUGGEST result. The contract allows
    /// repeated confirmation of the same report.
    pub fn apply_policy_suggestion(
        &mut self,
        ai_report_id: &str,
        confirm: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        if !confirm {
            return Err(ApiError::invalid("confirm", "must be true to apply"));
        }
        let job_id = self
            .ai_jobs_by_report
            .get(ai_report_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("unknown ai_report {ai_report_id}")))?;
        let job = self
            .ai_jobs
            .get(&job_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown ai_report {ai_report_id}")))?;
        if job.ai_job_type != AiJobType::PolicySuggest {
            return Err(ApiError::invalid(
                "ai_report_id",
                "referenced job is not a POLICY_SUGGEST",
            ));
        }
        if job.ai_job_status != AiJobStatus::Completed {
            return Err(ApiError::Conflict {
                code: "JOB_NOT_COMPLETED",
                message: format!("job for {ai_report_id} is {:?}", job.ai_job_status),
            });
        }
        let summary = format!("policy suggestion applied: ai_report_id={ai_report_id}");
        self.append_decision(
            DecisionType::PolicyApplied,
            DecisionBasis::Human,
            vec![ai_report_id.to_string()],
            &summary,
            now,
        );
        Ok(())
    }

    pub fn ai_job_items(&self) -> Vec<AiJobItem> {
        self.ai_job_order
            .iter()
            .filter_map(|id| self.ai_jobs.get(id))
            .map(|job| AiJobItem {
                ai_job_id: job.ai_job_id.clone(),
                ai_job_type: job.ai_job_type,
                ai_job_status: job.ai_job_status,
                incident_id: job.incident_id.clone(),
                model_tier: job.model_tier,
            })
            .collect()
    }

    fn emit_job_status(&mut self, job_id: &str, now: DateTime<Utc>) {
        let Some(job) = self.ai_jobs.get(job_id) else { return };
        let data = json!({
            "ai_job_id": job.ai_job_id,
            "ai_report_id": job.ai_report_id,
            "ai_job_type": job.ai_job_type,
            "ai_job_status": job.ai_job_status,
            "incident_id": job.incident_id,
            "model_tier": job.model_tier,
        });
        let id = job.ai_job_id.clone();
        self.emit_event(WebhookEventType::AiJobStatusChanged, "ai_job", &id, data, now);
    }
}
