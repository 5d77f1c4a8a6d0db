use serde::Serialize;
use serde_json::Value;

use crate::engine::Outcome;
use crate::error::{LibraryError, Result};

/// JSON body handed back to the HTTP layer: `{status, outcome, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub outcome: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn from_outcome<T: Serialize>(result: Result<Outcome<T>>) -> Self {
        match result {
            Ok(Outcome::Success { value }) => Self::ok("success", "Success", &value),
            Ok(Outcome::Renamed { value, suffix }) => {
                let mut response = Self::ok("renamed", "Renamed to avoid conflict", &value);
                if let Some(Value::Object(map)) = response.data.as_mut() {
                    map.insert("suffix".to_string(), Value::from(suffix));
                }
                response
            }
            Ok(Outcome::Recovered { report }) => Self {
                status: 202,
                outcome: "recovered",
                message: format!(
                    "{} already existed on disk and was imported",
                    report.root.title
                ),
                data: serde_json::to_value(&report).ok(),
            },
            Err(e) => Self::error(&e),
        }
    }

    pub fn from_list<T: Serialize>(result: Result<Vec<T>>) -> Self {
        match result {
            Ok(items) => Self::ok("success", "Success", &items),
            Err(e) => Self::error(&e),
        }
    }

    fn ok<T: Serialize>(outcome: &'static str, message: &str, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self {
                status: 200,
                outcome,
                message: message.to_string(),
                data: Some(data),
            },
            Err(e) => Self::error(&LibraryError::from(e)),
        }
    }

    fn error(e: &LibraryError) -> Self {
        let status = e.status_code();
        if status >= 500 {
            log::error!("Request failed: {}", e);
        }
        Self {
            status,
            outcome: "failure",
            message: e.to_string(),
            data: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"status":{},"outcome":"failure"}}"#, self.status)
        })
    }
}
