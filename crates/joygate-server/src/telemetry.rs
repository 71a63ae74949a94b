//! Segment-passed freshness signals: monotonic per segment, capped store with
//! oldest-by-ts eviction.

use chrono::{DateTime, TimeZone, Utc};
use joygate_contracts::{SegmentSignalView, TruthInputSource};
use joygate_kernel::iso_z;

use crate::error::ApiError;
use crate::store::{SegmentSignal, Store, SEGMENT_SIGNALS_CAP};

impl Store {
    /// Records one segment traversal. Older timestamps never rewrite newer
    /// ones; equal timestamps are last-writer-wins.
    pub fn segment_passed(
        &mut self,
        segment_id: &str,
        joykey: &str,
        fleet_id: Option<&str>,
        ts: i64,
        source: TruthInputSource,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        if ts > now.timestamp() + 60 {
            return Err(ApiError::invalid(
                "event_occurred_at",
                "more than 60 seconds in the future",
            ));
        }

        if let Some(existing) = self.segment_signals.get(segment_id) {
            if existing.last_passed_ts > ts {
                return Ok(());
            }
        }

        let at = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| ApiError::invalid("event_occurred_at", "out of range"))?;
        self.segment_signals.insert(
            segment_id.to_string(),
            SegmentSignal {
                segment_id: segment_id.to_string(),
                last_passed_ts: ts,
                last_passed_at: at,
                joykey: joykey.to_string(),
                truth_input_source: source,
                fleet_id: fleet_id.map(str::to_string),
            },
        );

        while self.segment_signals.len() > SEGMENT_SIGNALS_CAP {
            let oldest = self
                .segment_signals
                .values()
                .min_by_key(|s| (s.last_passed_ts, s.segment_id.clone()))
                .map(|s| s.segment_id.clone());
            match oldest {
                Some(id) => {
                    self.segment_signals.remove(&id);
                }
                None => break,
            }
        }
        Ok(())
    }

    pub fn segment_signal_views(&self) -> Vec<SegmentSignalView> {
        let mut items: Vec<&SegmentSignal> = self.segment_signals.values().collect();
        items.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        items
            .into_iter()
            .map(|s| SegmentSignalView {
                segment_id: s.segment_id.clone(),
                last_passed_ts: s.last_passed_ts,
                last_passed_at: iso_z(s.last_passed_at),
                joykey: s.joykey.clone(),
                truth_input_source: s.truth_input_source,
                fleet_id: s.fleet_id.clone(),
            })
            .collect()
    }
}
