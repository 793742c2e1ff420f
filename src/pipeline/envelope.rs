// Inbound envelope parsing and outbound merge

use crate::error::{HopscopeError, Result};
use crate::flow::{AugmentedSnapshot, FlowRecord};
use serde_json::{Map, Value};

/// Broker bookkeeping fields never forwarded downstream
pub const BOOKKEEPING_FIELDS: [&str; 3] = ["fields", "properties", "content"];

/// Parsed inbound message: the flow record plus every other field it carried
#[derive(Debug, Clone)]
pub struct Envelope {
    pub record: FlowRecord,
    passthrough: Map<String, Value>,
}

impl Envelope {
    /// Parse a UTF-8 JSON body; any failure is a malformed message
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| HopscopeError::MalformedMessage(format!("invalid JSON: {}", e)))?;

        let Value::Object(mut fields) = value else {
            return Err(HopscopeError::MalformedMessage(
                "expected a JSON object".to_string(),
            ));
        };

        let record: FlowRecord = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|e| HopscopeError::MalformedMessage(format!("not a flow record: {}", e)))?;

        for key in BOOKKEEPING_FIELDS {
            fields.remove(key);
        }

        Ok(Self {
            record,
            passthrough: fields,
        })
    }

    /// Passthrough fields with the augmented flow written over them
    pub fn merge(self, flow: &AugmentedSnapshot) -> Result<Map<String, Value>> {
        let augmented = serde_json::to_value(flow).map_err(|e| HopscopeError::Json {
            source: e,
            context: "Failed to serialize augmented flow".to_string(),
        })?;

        let mut merged = self.passthrough;
        if let Value::Object(fields) = augmented {
            merged.extend(fields);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Sizes;
    use crate::geo::IpSnapshot;
    use serde_json::json;

    fn snapshot() -> AugmentedSnapshot {
        AugmentedSnapshot {
            out_ip: IpSnapshot {
                address: "192.168.1.1".to_string(),
                geolocation: None,
            },
            out_port: Some(80),
            in_ip: IpSnapshot {
                address: "8.8.8.8".to_string(),
                geolocation: None,
            },
            in_port: Some(443),
            in_size: Sizes::default(),
            out_size: Sizes::default(),
            is_internal: false,
            routes: vec![],
            trace_status: "running".to_string(),
        }
    }

    #[test]
    fn test_parse_and_merge() {
        let body = json!({
            "outIP": "192.168.1.1",
            "outPort": 80,
            "inIp": "8.8.8.8",
            "inPort": 443,
            "protocol": "tcp",
            "fields": {"deliveryTag": 1},
            "properties": {},
            "content": "..."
        });
        let envelope = Envelope::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.record.in_ip, "8.8.8.8");

        let merged = envelope.merge(&snapshot()).unwrap();
        assert_eq!(merged["protocol"], "tcp");
        assert_eq!(merged["outIP"]["address"], "192.168.1.1");
        assert_eq!(merged["isInternal"], false);
        for key in BOOKKEEPING_FIELDS {
            assert!(!merged.contains_key(key), "{} should be stripped", key);
        }
    }

    #[test]
    fn test_malformed_bodies() {
        for body in [
            "not json",
            "[1, 2, 3]",
            r#"{"outIP": "10.0.0.1"}"#,
            r#"{"outIP": 5, "inIp": "10.0.0.1"}"#,
        ] {
            assert!(matches!(
                Envelope::parse(body.as_bytes()),
                Err(HopscopeError::MalformedMessage(_))
            ));
        }
    }
}
