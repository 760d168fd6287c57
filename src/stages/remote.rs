//! Closed parsing of loosely typed confirmation-service responses.
//!
//! Accepted shapes:
//!
//! ```text
//! {"detections": [{"label": "person", "score": 0.91, "box": [x, y, w, h]}, ...]}
//! {"error": "quota exceeded", "retryable": true}
//! ```
//!
//! Unknown fields are ignored. Detection entries without a label or score
//! are skipped rather than failing the whole response.

use serde::Deserialize;
use serde_json::Value;

use crate::cascade::{StageError, StageResult};
use crate::detect::{Detection, ObjectClass};

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    detections: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    retryable: Option<bool>,
}

#[derive(Deserialize)]
struct RawDetection {
    label: String,
    score: f32,
    #[serde(rename = "box", default)]
    bbox: Option<[f32; 4]>,
}

pub fn parse_confirmation(body: &str, min_score: f32, classes: &[ObjectClass]) -> StageResult {
    let raw: RawResponse = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            return StageResult::Failed(StageError::permanent(format!(
                "malformed confirmation response: {}",
                e
            )))
        }
    };

    if let Some(error) = raw.error.filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return StageResult::Failed(if raw.retryable.unwrap_or(true) {
            StageError::transient(message)
        } else {
            StageError::permanent(message)
        });
    }

    let Some(entries) = raw.detections else {
        return StageResult::Failed(StageError::permanent(
            "confirmation response has neither detections nor error",
        ));
    };

    let detections: Vec<Detection> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<RawDetection>(entry).ok())
        .filter(|d| d.score.is_finite() && d.score >= min_score)
        .map(|d| {
            let [x, y, w, h] = d.bbox.unwrap_or([0.0, 0.0, 1.0, 1.0]);
            Detection {
                x,
                y,
                w,
                h,
                confidence: d.score.min(1.0),
                class: ObjectClass::from_label(&d.label),
            }
        })
        .filter(|d| classes.is_empty() || classes.contains(&d.class))
        .collect();

    if detections.is_empty() {
        StageResult::Rejected(format!("no matching detection at or above {:.2}", min_score))
    } else {
        StageResult::Confirmed(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::StageErrorKind;

    #[test]
    fn person_above_threshold_confirms() {
        let body = r#"{"detections":[
            {"label":"person","score":0.91,"box":[0.1,0.2,0.3,0.4]},
            {"label":"cat","score":0.99}
        ],"model":"v7"}"#;
        match parse_confirmation(body, 0.5, &[ObjectClass::Person]) {
            StageResult::Confirmed(found) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].class, ObjectClass::Person);
                assert_eq!((found[0].x, found[0].h), (0.1, 0.4));
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[test]
    fn low_scores_reject() {
        let body = r#"{"detections":[{"label":"person","score":0.2}]}"#;
        assert!(matches!(
            parse_confirmation(body, 0.5, &[]),
            StageResult::Rejected(_)
        ));
        assert!(matches!(
            parse_confirmation(r#"{"detections":[]}"#, 0.5, &[]),
            StageResult::Rejected(_)
        ));
    }

    #[test]
    fn junk_entries_are_skipped() {
        let body = r#"{"detections":[{"label":"person"},{"score":"high"},{"label":"car","score":0.8}]}"#;
        match parse_confirmation(body, 0.5, &[]) {
            StageResult::Confirmed(found) => assert_eq!(found[0].class, ObjectClass::Vehicle),
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[test]
    fn error_responses_carry_retryability() {
        match parse_confirmation(r#"{"error":"overloaded"}"#, 0.5, &[]) {
            StageResult::Failed(e) => assert_eq!(e.kind, StageErrorKind::Transient),
            other => panic!("unexpected {:?}", other),
        }
        match parse_confirmation(r#"{"error":{"code":401},"retryable":false}"#, 0.5, &[]) {
            StageResult::Failed(e) => {
                assert_eq!(e.kind, StageErrorKind::Permanent);
                assert!(e.message.contains("401"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_bodies_fail_permanently() {
        for body in ["not json", "[1,2,3]", r#"{"status":"ok"}"#] {
            match parse_confirmation(body, 0.5, &[]) {
                StageResult::Failed(e) => assert_eq!(e.kind, StageErrorKind::Permanent),
                other => panic!("{} gave {:?}", body, other),
            }
        }
    }
}
