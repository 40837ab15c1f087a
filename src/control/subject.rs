use crate::error::{NexError, Result};

use super::envelope::PayloadType;
use super::types::API_PREFIX;

/// A control operation addressed under the `$NEX` prefix.
///
/// Ping may be fleet-wide (no node id); info and run always target one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSubject {
    Ping { node_id: Option<String> },
    Info { node_id: String },
    Run { node_id: String },
}

impl ControlSubject {
    pub fn parse(subject: &str) -> Result<Self> {
        let mut tokens = subject.split('.');
        if tokens.next() != Some(API_PREFIX) {
            return Err(NexError::InvalidRequest(format!(
                "subject outside {} namespace: {}",
                API_PREFIX, subject
            )));
        }

        let operation = tokens.next().unwrap_or_default();
        let node_id = match tokens.next() {
            Some("") => {
                return Err(NexError::InvalidRequest(format!(
                    "empty node id in subject: {}",
                    subject
                )))
            }
            token => token.map(str::to_string),
        };
        if tokens.next().is_some() {
            return Err(NexError::InvalidRequest(format!(
                "unexpected trailing tokens in subject: {}",
                subject
            )));
        }

        match (operation, node_id) {
            ("PING", node_id) => Ok(ControlSubject::Ping { node_id }),
            ("INFO", Some(node_id)) => Ok(ControlSubject::Info { node_id }),
            ("RUN", Some(node_id)) => Ok(ControlSubject::Run { node_id }),
            _ => Err(NexError::InvalidRequest(format!(
                "unknown control subject: {}",
                subject
            ))),
        }
    }

    /// Whether a node with `node_id` should answer this subject.
    pub fn targets(&self, node_id: &str) -> bool {
        match self {
            ControlSubject::Ping { node_id: None } => true,
            ControlSubject::Ping { node_id: Some(id) }
            | ControlSubject::Info { node_id: id }
            | ControlSubject::Run { node_id: id } => id == node_id,
        }
    }

    /// Type tag of the envelope sent back for this operation.
    pub fn response_type(&self) -> PayloadType {
        match self {
            ControlSubject::Ping { .. } => PayloadType::Ping,
            ControlSubject::Info { .. } => PayloadType::Info,
            ControlSubject::Run { .. } => PayloadType::Run,
        }
    }
}

impl std::fmt::Display for ControlSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlSubject::Ping { node_id: None } => write!(f, "{}.PING", API_PREFIX),
            ControlSubject::Ping { node_id: Some(id) } => write!(f, "{}.PING.{}", API_PREFIX, id),
            ControlSubject::Info { node_id } => write!(f, "{}.INFO.{}", API_PREFIX, node_id),
            ControlSubject::Run { node_id } => write!(f, "{}.RUN.{}", API_PREFIX, node_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_subjects() {
        assert_eq!(
            ControlSubject::parse("$NEX.PING").unwrap(),
            ControlSubject::Ping { node_id: None }
        );
        assert_eq!(
            ControlSubject::parse("$NEX.INFO.NODE1").unwrap(),
            ControlSubject::Info {
                node_id: "NODE1".to_string()
            }
        );
        assert_eq!(
            ControlSubject::parse("$NEX.RUN.NODE1").unwrap(),
            ControlSubject::Run {
                node_id: "NODE1".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_subjects() {
        assert!(ControlSubject::parse("NEX.PING").is_err());
        assert!(ControlSubject::parse("$NEX.RUN").is_err());
        assert!(ControlSubject::parse("$NEX.INFO.").is_err());
        assert!(ControlSubject::parse("$NEX.PING.").is_err());
        assert!(ControlSubject::parse("$NEX.RUN.").is_err());
        assert!(ControlSubject::parse("$NEX.STOP.NODE1").is_err());
        assert!(ControlSubject::parse("$NEX.RUN.NODE1.extra").is_err());
    }

    #[test]
    fn display_round_trips() {
        for raw in ["$NEX.PING", "$NEX.PING.N1", "$NEX.INFO.N1", "$NEX.RUN.N1"] {
            assert_eq!(ControlSubject::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn targeting() {
        assert!(ControlSubject::parse("$NEX.PING").unwrap().targets("ANY"));
        let run = ControlSubject::parse("$NEX.RUN.N1").unwrap();
        assert!(run.targets("N1"));
        assert!(!run.targets("N2"));
        assert_eq!(run.response_type(), PayloadType::Run);
    }
}
