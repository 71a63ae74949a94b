//! Vision providers and the deterministic world renderer. The renderer turns
//! the frozen snapshot into a small PPM raster; providers turn that image plus
//! an incident into an audit summary. Provider errors never surface raw --
//! they degrade to a stable fallback with no confidence, which blocks status
//! promotion downstream.

use base64::Engine;
use joygate_config::{AiProviderKind, Config};
use joygate_contracts::IncidentItem;
use serde_json::{json, Value};
use thiserror::Error;

use crate::store::RenderSnapshot;

const GRID: i32 = 64;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cell ({0}, {1}) is outside the {GRID}x{GRID} grid")]
    OutOfBounds(i32, i32),
}

/// Renders the snapshot as a binary PPM (P6) raster. Tracks are grey,
/// chargers green, the blocked cell red.
pub fn render_snapshot(snapshot: &RenderSnapshot) -> Result<Vec<u8>, RenderError> {
    let mut pixels = vec![[0u8; 3]; (GRID * GRID) as usize];
    let mut paint = |cell: (i32, i32), rgb: [u8; 3]| -> Result<(), RenderError> {
        let (x, y) = cell;
        if !(0..GRID).contains(&x) || !(0..GRID).contains(&y) {
            return Err(RenderError::OutOfBounds(x, y));
        }
        pixels[(y * GRID + x) as usize] = rgb;
        Ok(())
    };

    for track in &snapshot.robot_tracks {
        for cell in &track.cells {
            paint(*cell, [160, 160, 160])?;
        }
    }
    for charger in &snapshot.chargers {
        paint(charger.cell, [0, 200, 0])?;
    }
    if let Some(cell) = snapshot.blocked_cell {
        paint(cell, [220, 0, 0])?;
    }

    let mut out = format!("P6\n{GRID} {GRID}\n255\n").into_bytes();
    for px in pixels {
        out.extend_from_slice(&px);
    }
    Ok(out)
}

/// What a vision pass concluded. `confidence = None` means the result must
/// not promote the incident.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditOutcome {
    pub summary: String,
    pub confidence: Option<f64>,
}

impl AuditOutcome {
    pub fn budget_skipped() -> AuditOutcome {
        AuditOutcome {
            summary: "skipped due to budget".to_string(),
            confidence: None,
        }
    }
}

#[derive(Debug, Error)]
enum ProviderError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape")]
    Shape,
}

/// Vision provider selected once at start from configuration.
#[derive(Debug, Clone)]
pub enum Provider {
    Mock,
    Gemini {
        client: reqwest::Client,
        api_key: String,
    },
}

impl Provider {
    pub fn from_config(cfg: &Config) -> Provider {
        match cfg.ai.provider {
            AiProviderKind::Mock => Provider::Mock,
            AiProviderKind::Gemini => Provider::Gemini {
                client: reqwest::Client::new(),
                api_key: cfg.ai.gemini_api_key.clone().unwrap_or_default(),
            },
        }
    }

    /// Runs one audit. Must be called outside any store lock.
    pub async fn vision_audit(&self, image_ppm: &[u8], incident: &IncidentItem) -> AuditOutcome {
        match self {
            Provider::Mock => mock_outcome(incident),
            Provider::Gemini { client, api_key } => {
                match gemini_describe(client, api_key, image_ppm, incident).await {
                    Ok(text) => AuditOutcome {
                        summary: format!("vision audit: {text}"),
                        confidence: Some(0.8),
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "vision provider failed, using fallback");
                        AuditOutcome {
                            summary: format!(
                                "vision audit fallback: provider unavailable, incident_id={}",
                                incident.incident_id
                            ),
                            confidence: None,
                        }
                    }
                }
            }
        }
    }
}

fn mock_outcome(incident: &IncidentItem) -> AuditOutcome {
    let charger = incident.charger_id.as_deref().unwrap_or("-");
    AuditOutcome {
        summary: format!(
            "vision audit: incident_id={} incident_type={:?} charger_id={charger}; \
             scene consistent with report",
            incident.incident_id, incident.incident_type
        ),
        confidence: Some(0.9),
    }
}

async fn gemini_describe(
    client: &reqwest::Client,
    api_key: &str,
    image_ppm: &[u8],
    incident: &IncidentItem,
) -> Result<String, ProviderError> {
    let prompt = format!(
        "Audit this top-down fleet map for incident {} ({:?}). \
         State in one sentence whether the reported obstruction is visible.",
        incident.incident_id, incident.incident_type
    );
    let body = json!({
        "contents": [{
            "parts": [
                { "text": prompt },
                { "inline_data": {
                    "mime_type": "image/x-portable-pixmap",
                    "data": base64::engine::general_purpose::STANDARD.encode(image_ppm),
                }},
            ],
        }],
    });
    let resp: Value = client
        .post(format!(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent?key={api_key}"
        ))
        .json(&body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    resp.pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or(ProviderError::Shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChargerCell, RobotTrack};
    use joygate_contracts::{IncidentStatus, IncidentType};

    fn snapshot() -> RenderSnapshot {
        RenderSnapshot {
            robot_tracks: vec![RobotTrack {
                joykey: "w1".to_string(),
                cells: vec![(0, 0), (0, 1)],
            }],
            chargers: vec![ChargerCell {
                charger_id: "charger-001".to_string(),
                cell: (4, 10),
            }],
            blocked_cell: Some((5, 9)),
        }
    }

    #[test]
    fn render_is_deterministic_ppm() {
        let a = render_snapshot(&snapshot()).unwrap();
        let b = render_snapshot(&snapshot()).unwrap();
        assert_eq!(a, b);
        let header = b"P6\n64 64\n255\n";
        assert!(a.starts_with(header));
        assert_eq!(a.len(), header.len() + 64 * 64 * 3);
    }

    #[test]
    fn render_rejects_out_of_grid_cells() {
        let mut snap = snapshot();
        snap.blocked_cell = Some((64, 0));
        assert!(matches!(
            render_snapshot(&snap),
            Err(RenderError::OutOfBounds(64, 0))
        ));
    }

    #[test]
    fn mock_outcome_carries_confidence() {
        let item = IncidentItem {
            incident_id: "inc_aaaaaaaaaaaa".to_string(),
            incident_type: IncidentType::Blocked,
            incident_status: IncidentStatus::Open,
            charger_id: Some("charger-001".to_string()),
            segment_id: None,
            snapshot_ref: None,
            evidence_refs: vec![],
            ai_insights: vec![],
        };
        let outcome = mock_outcome(&item);
        assert!(outcome.confidence.is_some());
        assert!(outcome.summary.contains("inc_aaaaaaaaaaaa"));
        assert!(outcome.summary.contains("charger-001"));
    }
}
