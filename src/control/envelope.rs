use serde::{Deserialize, Serialize};

use super::types::{INFO_RESPONSE_TYPE, PING_RESPONSE_TYPE, RUN_RESPONSE_TYPE};

/// Error carried by an envelope built with neither data nor an error.
pub const MISSING_DATA_ERROR: &str = "missing response data";

/// The three reply shapes a subscriber can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    #[serde(rename = "io.nats.nex.v1.info_response")]
    Info,
    #[serde(rename = "io.nats.nex.v1.ping_response")]
    Ping,
    #[serde(rename = "io.nats.nex.v1.run_response")]
    Run,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Info => INFO_RESPONSE_TYPE,
            PayloadType::Ping => PING_RESPONSE_TYPE,
            PayloadType::Run => RUN_RESPONSE_TYPE,
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either the reply payload or the error that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeBody<T> {
    Data(T),
    Error(String),
}

/// Wrapper around every control-plane reply.
///
/// On the wire this is `{"type": ..., "data": ...}` or `{"type": ..., "error": ...}`;
/// exactly one of `data` and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    payload_type: PayloadType,
    #[serde(flatten)]
    body: EnvelopeBody<T>,
}

impl<T> Envelope<T> {
    /// An error, when given, wins over data.
    pub fn new(payload_type: PayloadType, data: Option<T>, error: Option<String>) -> Self {
        let body = match (data, error) {
            (_, Some(error)) => EnvelopeBody::Error(error),
            (Some(data), None) => EnvelopeBody::Data(data),
            (None, None) => EnvelopeBody::Error(MISSING_DATA_ERROR.to_string()),
        };
        Self { payload_type, body }
    }

    pub fn success(payload_type: PayloadType, data: T) -> Self {
        Self {
            payload_type,
            body: EnvelopeBody::Data(data),
        }
    }

    pub fn failure(payload_type: PayloadType, error: impl Into<String>) -> Self {
        Self {
            payload_type,
            body: EnvelopeBody::Error(error.into()),
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn data(&self) -> Option<&T> {
        match &self.body {
            EnvelopeBody::Data(data) => Some(data),
            EnvelopeBody::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::Data(_) => None,
            EnvelopeBody::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, EnvelopeBody::Error(_))
    }

    pub fn into_result(self) -> std::result::Result<T, String> {
        match self.body {
            EnvelopeBody::Data(data) => Ok(data),
            EnvelopeBody::Error(error) => Err(error),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::types::RunResponse;

    fn response() -> RunResponse {
        RunResponse {
            started: true,
            machine_id: "m-1".to_string(),
            public_key: "MWORKLOAD".to_string(),
            issuer: "AISSUER".to_string(),
            hash: "SHA-256=abc".to_string(),
        }
    }

    #[test]
    fn data_without_error_sets_data() {
        let env = Envelope::new(PayloadType::Run, Some(response()), None);
        assert_eq!(env.data(), Some(&response()));
        assert!(env.error().is_none());
        assert!(!env.is_error());
    }

    #[test]
    fn error_clears_data() {
        let env = Envelope::new(PayloadType::Run, Some(response()), Some("boom".to_string()));
        assert_eq!(env.error(), Some("boom"));
        assert!(env.data().is_none());

        let env: Envelope<RunResponse> = Envelope::new(PayloadType::Run, None, Some("boom".to_string()));
        assert_eq!(env.error(), Some("boom"));
        assert!(env.data().is_none());
    }

    #[test]
    fn neither_data_nor_error_becomes_error() {
        let env: Envelope<RunResponse> = Envelope::new(PayloadType::Run, None, None);
        assert_eq!(env.error(), Some(MISSING_DATA_ERROR));
    }

    #[test]
    fn wire_shape_has_exactly_one_body_field() {
        let ok = serde_json::to_value(Envelope::success(PayloadType::Run, response())).unwrap();
        assert_eq!(ok["type"], RUN_RESPONSE_TYPE);
        assert_eq!(ok["data"]["machine_id"], "m-1");
        assert!(ok.get("error").is_none());

        let err =
            serde_json::to_value(Envelope::<RunResponse>::failure(PayloadType::Run, "boom")).unwrap();
        assert_eq!(err["type"], RUN_RESPONSE_TYPE);
        assert_eq!(err["error"], "boom");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn envelope_decodes_from_wire() {
        let raw = r#"{"type":"io.nats.nex.v1.run_response","error":"not found"}"#;
        let env: Envelope<RunResponse> = serde_json::from_str(raw).unwrap();
        assert_eq!(env.payload_type(), PayloadType::Run);
        assert_eq!(env.into_result(), Err("not found".to_string()));
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let raw = r#"{"type":"io.nats.nex.v1.bogus","error":"x"}"#;
        assert!(serde_json::from_str::<Envelope<RunResponse>>(raw).is_err());
    }

    #[test]
    fn payload_type_names() {
        assert_eq!(PayloadType::Info.to_string(), INFO_RESPONSE_TYPE);
        assert_eq!(PayloadType::Ping.to_string(), PING_RESPONSE_TYPE);
        assert_eq!(PayloadType::Run.as_str(), RUN_RESPONSE_TYPE);
    }
}
