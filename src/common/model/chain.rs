use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, StageError};

/// Transform a stage is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    Gray,
    Gauss,
    Threshold,
    Recognition,
}

impl FilterType {
    pub const ALL: [FilterType; 4] = [
        FilterType::Gray,
        FilterType::Gauss,
        FilterType::Threshold,
        FilterType::Recognition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::Gray => "GRAY",
            FilterType::Gauss => "GAUSS",
            FilterType::Threshold => "THRESHOLD",
            FilterType::Recognition => "RECOGNITION",
        }
    }

    /// Lower-case form used in topic names and ledger rows.
    pub fn slug(&self) -> &'static str {
        match self {
            FilterType::Gray => "gray",
            FilterType::Gauss => "gauss",
            FilterType::Threshold => "threshold",
            FilterType::Recognition => "recognition",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterType::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StageError::UnknownFilter(s.to_string()).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Done,
    Fail,
}

/// Unit of work travelling between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRequest {
    pub image_id: String,
    pub request_id: String,
    pub filters: Vec<FilterType>,
}

impl ChainRequest {
    pub fn new(
        image_id: impl Into<String>,
        request_id: impl Into<String>,
        filters: Vec<FilterType>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            request_id: request_id.into(),
            filters,
        }
    }

    pub fn head(&self) -> Option<FilterType> {
        self.filters.first().copied()
    }

    /// The request that goes to the next hop: new payload, same request, head removed.
    pub fn advance(&self, image_id: impl Into<String>) -> ChainRequest {
        ChainRequest {
            image_id: image_id.into(),
            request_id: self.request_id.clone(),
            filters: self.filters.iter().skip(1).copied().collect(),
        }
    }

    pub fn to_bytes(&self) -> crate::errors::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::errors::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Terminal notification for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub request_id: String,
    pub status: ImageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DoneEvent {
    pub fn done(image_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            image_id: Some(image_id.into()),
            request_id: request_id.into(),
            status: ImageStatus::Done,
            message: None,
        }
    }

    pub fn failed(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            image_id: None,
            request_id: request_id.into(),
            status: ImageStatus::Fail,
            message: Some(message.into()),
        }
    }

    pub fn to_bytes(&self) -> crate::errors::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::errors::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_request_wire_format() {
        let json = r#"{"imageId":"a1","requestId":"r1","filters":["GRAY","GAUSS"]}"#;
        let req = ChainRequest::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(req.image_id, "a1");
        assert_eq!(req.request_id, "r1");
        assert_eq!(req.filters, vec![FilterType::Gray, FilterType::Gauss]);
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let json = r#"{"imageId":"a1","requestId":"r1","filters":["SEPIA"]}"#;
        assert!(ChainRequest::from_bytes(json.as_bytes()).is_err());
        assert!("sepia".parse::<FilterType>().is_err());
        assert_eq!("gauss".parse::<FilterType>().unwrap(), FilterType::Gauss);
    }

    #[test]
    fn test_advance_shrinks_by_one() {
        let req = ChainRequest::new(
            "a1",
            "r1",
            vec![FilterType::Gray, FilterType::Threshold, FilterType::Gauss],
        );
        let next = req.advance("b2");
        assert_eq!(next.image_id, "b2");
        assert_eq!(next.request_id, "r1");
        assert_eq!(next.filters, vec![FilterType::Threshold, FilterType::Gauss]);
        assert_eq!(req.filters.len(), 3);
    }

    #[test]
    fn test_done_event_shapes() {
        let ok = serde_json::to_value(DoneEvent::done("img", "req")).unwrap();
        assert_eq!(ok["status"], "DONE");
        assert_eq!(ok["imageId"], "img");
        assert!(ok.get("message").is_none());

        let failed = serde_json::to_value(DoneEvent::failed("req", "boom")).unwrap();
        assert_eq!(failed["status"], "FAIL");
        assert_eq!(failed["message"], "boom");
        assert!(failed.get("imageId").is_none());
    }
}
