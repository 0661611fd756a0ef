//! Inter-stage handoff data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ResourceId, StageName};

/// Output written by one stage for the stages after it. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub stage: StageName,
    /// Attempt that produced the data; 0 for intake payloads.
    pub attempt: u32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The newest payload per stage for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorPayloads(BTreeMap<StageName, serde_json::Value>);

impl PriorPayloads {
    /// Keep the newest payload per stage from an arbitrary list.
    pub fn from_payloads(payloads: impl IntoIterator<Item = Payload>) -> Self {
        let mut newest: BTreeMap<StageName, Payload> = BTreeMap::new();
        for payload in payloads {
            match newest.get(&payload.stage) {
                Some(existing) if existing.id >= payload.id => {}
                _ => {
                    newest.insert(payload.stage.clone(), payload);
                }
            }
        }
        Self(newest.into_iter().map(|(k, v)| (k, v.data)).collect())
    }

    pub fn get(&self, stage: &StageName) -> Option<&serde_json::Value> {
        self.0.get(stage)
    }

    pub fn get_str(&self, stage: &str) -> Option<&serde_json::Value> {
        self.0.iter().find(|(k, _)| k.as_str() == stage).map(|(_, v)| v)
    }

    pub fn contains(&self, stage: &StageName) -> bool {
        self.0.contains_key(stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageName> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(job_id: ResourceId, stage: &str, attempt: u32, data: serde_json::Value) -> Payload {
        Payload {
            id: ResourceId::new(),
            job_id,
            stage: StageName::new(stage).unwrap(),
            attempt,
            data,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_newest_payload_wins() {
        let job = ResourceId::new();
        let older = payload(job, "research", 1, json!({"v": 1}));
        let newer = payload(job, "research", 2, json!({"v": 2}));
        let outline = payload(job, "outline", 1, json!({"sections": 3}));

        // Order of the input must not matter.
        let prior = PriorPayloads::from_payloads(vec![newer, outline, older]);

        assert_eq!(prior.len(), 2);
        assert_eq!(prior.get_str("research"), Some(&json!({"v": 2})));
        assert_eq!(prior.get_str("outline"), Some(&json!({"sections": 3})));
        assert!(prior.get_str("draft").is_none());
    }
}
