use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::SegmentParameters;

/// Counts from the backend sometimes arrive as integral floats (`3.0`).
mod count {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawCount {
        Int(u64),
        Float(f64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawCount::deserialize(deserializer)? {
            RawCount::Int(value) => Ok(value),
            RawCount::Float(value) if value.is_finite() && value >= 0.0 && value.fract() == 0.0 => {
                Ok(value as u64)
            }
            RawCount::Float(value) => Err(serde::de::Error::custom(format!(
                "expected a non-negative whole number, got {value}"
            ))),
        }
    }

    pub fn deserialize_vec<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(deserialize_with = "crate::protocol::count::deserialize")] u64);

        let items = Vec::<Wrapped>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|Wrapped(v)| v).collect())
    }

    pub fn deserialize_opt_vec<'de, D>(deserializer: D) -> Result<Option<Vec<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(
            #[serde(deserialize_with = "crate::protocol::count::deserialize_vec")] Vec<u64>,
        );

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(v)| v))
    }
}

/// Implements `into_result` for a `{success, message?, <payload>?}` response envelope.
macro_rules! envelope {
    ($name:ident, $field:ident, $payload:ty) => {
        impl $name {
            /// Returns the payload when the backend reported success and included it,
            /// otherwise the server-provided message (or `fallback`).
            pub fn into_result(self, fallback: &str) -> Result<$payload, String> {
                match (self.success, self.$field) {
                    (true, Some(payload)) => Ok(payload),
                    _ => Err(self
                        .message
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| fallback.to_string())),
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    #[serde(deserialize_with = "count::deserialize_vec")]
    pub data_shape: Vec<u64>,
    pub total_samples: f64,
    pub duration_seconds: f64,
    #[serde(deserialize_with = "count::deserialize")]
    pub max_possible_segments: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
}

envelope!(UploadResponse, file_info, FileInfo);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetUploadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_count: Option<u64>,
}

envelope!(DatasetUploadResponse, total_count, u64);

fn deserialize_opt_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "crate::protocol::count::deserialize")] u64);

    Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(v)| v))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateParametersRequest {
    pub trim_seconds: f64,
    pub y_segments: u32,
}

impl From<&SegmentParameters> for ValidateParametersRequest {
    fn from(params: &SegmentParameters) -> Self {
        Self {
            trim_seconds: params.trim_seconds,
            y_segments: params.y_segments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationInfo {
    pub trim_seconds: f64,
    #[serde(deserialize_with = "count::deserialize")]
    pub y_segments: u64,
    pub total_samples: f64,
    pub after_trim_samples: f64,
    #[serde(deserialize_with = "count::deserialize")]
    pub available_segments: u64,
    #[serde(deserialize_with = "count::deserialize")]
    pub final_segments: u64,
    pub will_use_all_segments: bool,
}

impl ValidationInfo {
    /// Checks the relationships the rest of the workflow relies on.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.final_segments > self.available_segments {
            return Err(format!(
                "final_segments ({}) exceeds available_segments ({})",
                self.final_segments, self.available_segments
            ));
        }
        if self.will_use_all_segments != (self.final_segments == self.y_segments) {
            return Err(format!(
                "will_use_all_segments={} contradicts final_segments={} / y_segments={}",
                self.will_use_all_segments, self.final_segments, self.y_segments
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_info: Option<ValidationInfo>,
}

envelope!(ValidationResponse, validation_info, ValidationInfo);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub trim_seconds: f64,
    pub y_segments: u32,
    pub save_filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    #[serde(deserialize_with = "count::deserialize")]
    pub segments_created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(
        default,
        deserialize_with = "count::deserialize_opt_vec",
        skip_serializing_if = "Option::is_none"
    )]
    pub original_shape: Option<Vec<u64>>,
    #[serde(
        default,
        deserialize_with = "count::deserialize_opt_vec",
        skip_serializing_if = "Option::is_none"
    )]
    pub final_shape: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_info: Option<ProcessingInfo>,
}

envelope!(ProcessingResponse, processing_info, ProcessingInfo);

/// Server-held session flags for the current client identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    pub client_id: Option<String>,
    pub has_data_set: bool,
    pub has_labels: bool,
    pub has_model: bool,
    pub has_params: bool,
    pub session_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_info_accepts_integral_float_counts() {
        let info: FileInfo = serde_json::from_value(serde_json::json!({
            "filename": "walk.csv",
            "data_shape": [1000, 4],
            "total_samples": 10.0,
            "duration_seconds": 10.0,
            "max_possible_segments": 3.0
        }))
        .expect("file info");
        assert_eq!(info.max_possible_segments, 3);
        assert_eq!(info.data_shape, vec![1000, 4]);
    }

    #[test]
    fn fractional_count_is_rejected() {
        let err = serde_json::from_value::<FileInfo>(serde_json::json!({
            "filename": "walk.csv",
            "data_shape": [1000, 4],
            "total_samples": 10.0,
            "duration_seconds": 10.0,
            "max_possible_segments": 2.5
        }))
        .expect_err("fractional count");
        assert!(err.to_string().contains("whole number"));
    }

    #[test]
    fn envelope_prefers_server_message_over_fallback() {
        let response: ValidationResponse = serde_json::from_value(serde_json::json!({
            "success": false,
            "message": "y_segments too large"
        }))
        .expect("response");
        assert_eq!(
            response.into_result("invalid parameters").expect_err("rejected"),
            "y_segments too large"
        );

        let response: ValidationResponse =
            serde_json::from_value(serde_json::json!({ "success": true })).expect("response");
        assert_eq!(
            response.into_result("invalid parameters").expect_err("no payload"),
            "invalid parameters"
        );
    }

    #[test]
    fn validation_consistency_checks_segment_relationships() {
        let mut info = ValidationInfo {
            trim_seconds: 0.0,
            y_segments: 5,
            total_samples: 3000.0,
            after_trim_samples: 3000.0,
            available_segments: 10,
            final_segments: 5,
            will_use_all_segments: true,
        };
        assert!(info.check_consistency().is_ok());

        info.final_segments = 11;
        info.will_use_all_segments = false;
        assert!(info.check_consistency().is_err());

        info.final_segments = 4;
        info.will_use_all_segments = true;
        assert!(info.check_consistency().is_err());
    }

    #[test]
    fn session_snapshot_tolerates_missing_fields() {
        let snapshot: SessionSnapshot =
            serde_json::from_value(serde_json::json!({ "client_id": null, "has_model": true }))
                .expect("snapshot");
        assert_eq!(snapshot.client_id, None);
        assert!(snapshot.has_model);
        assert!(!snapshot.has_data_set);
        assert!(snapshot.session_keys.is_empty());
    }
}
