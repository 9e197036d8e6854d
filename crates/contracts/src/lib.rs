use serde::{Deserialize, Serialize};

pub mod identity;

pub use identity::{IdentityToken, InvalidIdentity};

/// Lowest accepted star rating.
pub const RATING_MIN: i64 = 1;
/// Highest accepted star rating.
pub const RATING_MAX: i64 = 5;

/// Sentinel `viewCount` reported at the HTTP boundary for a suppressed view.
pub const DEDUPLICATED_VIEW_COUNT: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRequest {
    #[serde(default)]
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewResponse {
    pub view_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
}

/// Result of a view request. Internal callers branch on the variant; only the
/// HTTP boundary folds `Deduplicated` into the `-1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOutcome {
    Counted(i64),
    Deduplicated,
}

impl ViewOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewOutcome::Counted(_) => "counted",
            ViewOutcome::Deduplicated => "deduplicated",
        }
    }
}

impl From<ViewOutcome> for ViewResponse {
    fn from(value: ViewOutcome) -> Self {
        match value {
            ViewOutcome::Counted(view_count) => ViewResponse {
                view_count,
                deduplicated: None,
            },
            ViewOutcome::Deduplicated => ViewResponse {
                view_count: DEDUPLICATED_VIEW_COUNT,
                deduplicated: Some(true),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingQuery {
    pub subject_id: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    pub subject_id: String,
    /// Kept wide so out-of-range values reach validation instead of failing
    /// JSON decoding.
    pub rating: i64,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
    pub caller_rating: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttemptRequest {
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCheck {
    pub allowed: bool,
    pub remaining: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
}

pub fn is_valid_rating(value: i64) -> bool {
    (RATING_MIN..=RATING_MAX).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicated_view_serializes_with_sentinel() {
        let body = serde_json::to_value(ViewResponse::from(ViewOutcome::Deduplicated))
            .expect("serialize");
        assert_eq!(
            body,
            serde_json::json!({"viewCount": -1, "deduplicated": true})
        );
    }

    #[test]
    fn counted_view_omits_deduplicated_flag() {
        let body =
            serde_json::to_value(ViewResponse::from(ViewOutcome::Counted(7))).expect("serialize");
        assert_eq!(body, serde_json::json!({"viewCount": 7}));
    }

    #[test]
    fn rating_summary_serializes_missing_caller_rating_as_null() {
        let body = serde_json::to_value(RatingSummary {
            average: 0.0,
            count: 0,
            caller_rating: None,
        })
        .expect("serialize");
        assert_eq!(
            body,
            serde_json::json!({"average": 0.0, "count": 0, "callerRating": null})
        );
    }

    #[test]
    fn rating_request_accepts_out_of_range_values_for_later_validation() {
        let req: RatingRequest =
            serde_json::from_value(serde_json::json!({"subjectId": "M1", "rating": 9}))
                .expect("decode");
        assert_eq!(req.rating, 9);
        assert!(req.fingerprint.is_none());
        assert!(!is_valid_rating(req.rating));
        assert!(is_valid_rating(1) && is_valid_rating(5));
        assert!(!is_valid_rating(0));
    }

    #[test]
    fn login_check_omits_reset_at_when_unlocked() {
        let body = serde_json::to_value(LoginCheck {
            allowed: true,
            remaining: 5,
            reset_at: None,
        })
        .expect("serialize");
        assert_eq!(body, serde_json::json!({"allowed": true, "remaining": 5}));
    }
}
