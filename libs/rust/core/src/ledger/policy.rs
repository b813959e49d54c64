use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{value_as_string, Condition, Query};
use crate::error::LedgerError;

/// A policy as written: one key mapping to an attribute object.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub key: String,
    pub attributes: Map<String, Value>,
}

impl Policy {
    pub fn new(key: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self { key: key.into(), attributes }
    }

    pub fn to_json(&self) -> Value {
        let mut outer = Map::new();
        outer.insert(self.key.clone(), Value::Object(self.attributes.clone()));
        Value::Object(outer)
    }

    /// Request body for `blockchain insert where policy = !my_policy ...`.
    pub fn body(&self) -> String {
        format!("<my_policy = {}>", self.to_json())
    }

    /// Content-derived id; identical policies collide, which is what makes
    /// a repeated insert detectable as a duplicate.
    pub fn content_id(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.to_json().to_string().as_bytes());
        hex::encode(&h.finalize()[..16])
    }
}

/// A policy as read back, carrying the ledger-assigned id when present.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRecord {
    pub key: String,
    pub id: Option<String>,
    pub attributes: Map<String, Value>,
}

impl PolicyRecord {
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).map(value_as_string)
    }
}

/// Parses a `get` reply: `[{"<key>": {..., "id": "..."}}, ...]`.
pub fn parse_records(body: &str) -> Result<Vec<PolicyRecord>, LedgerError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let items = match serde_json::from_str::<Value>(trimmed)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        obj @ Value::Object(_) => vec![obj],
        other => return Err(LedgerError::Decode(format!("unexpected reply: {other}"))),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(outer) = item else {
            return Err(LedgerError::Decode(format!("policy is not an object: {item}")));
        };
        for (key, inner) in outer {
            let Value::Object(mut attributes) = inner else {
                return Err(LedgerError::Decode(format!("policy {key} has no attribute object")));
            };
            let id = attributes.remove("id").map(|v| value_as_string(&v));
            out.push(PolicyRecord { key, id, attributes });
        }
    }
    Ok(out)
}

/// Parses a `count` reply, which arrives as a number, a numeric string, or a list.
pub fn parse_count(body: &str) -> Result<usize, LedgerError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Number(n)) => n.as_u64().map(|n| n as usize).ok_or_else(|| LedgerError::Decode(format!("bad count {n}"))),
        Ok(Value::Array(items)) => Ok(items.len()),
        Ok(Value::String(s)) => s.trim().parse().map_err(|_| LedgerError::Decode(format!("bad count {s:?}"))),
        Ok(other) => Err(LedgerError::Decode(format!("bad count {other}"))),
        Err(_) => trimmed.parse().map_err(|_| LedgerError::Decode(format!("bad count {trimmed:?}"))),
    }
}

/// A typed record stored under a ledger key.
pub trait LedgerRecord: Serialize + DeserializeOwned {
    fn key(&self) -> String;

    /// Attribute filters singling this record out among others sharing its key.
    fn identity(&self) -> Vec<Condition> {
        Vec::new()
    }

    fn lookup(&self) -> Query {
        Query::key(self.key()).with_conditions(self.identity())
    }

    fn to_policy(&self) -> Result<Policy, LedgerError> {
        match serde_json::to_value(self)? {
            Value::Object(attributes) => Ok(Policy::new(self.key(), attributes)),
            other => Err(LedgerError::Decode(format!("record {} is not an object: {other}", self.key()))),
        }
    }

    fn from_record(record: &PolicyRecord) -> Result<Self, LedgerError> {
        Ok(serde_json::from_value(Value::Object(record.attributes.clone()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker { name: String, round: u64 }

    impl LedgerRecord for Marker {
        fn key(&self) -> String { format!("{}-m", self.name) }
        fn identity(&self) -> Vec<Condition> { vec![Condition::eq("round", self.round)] }
    }

    #[test]
    fn policy_body_and_ids() {
        let m = Marker { name: "demo".into(), round: 2 };
        let p = m.to_policy().unwrap();
        assert_eq!(p.body(), r#"<my_policy = {"demo-m":{"name":"demo","round":2}}>"#);
        assert_eq!(p.content_id(), m.to_policy().unwrap().content_id());
        let other = Marker { name: "demo".into(), round: 3 }.to_policy().unwrap();
        assert_ne!(p.content_id(), other.content_id());
        assert_eq!(m.lookup().to_command(false), "blockchain get demo-m where [round] = 2");
    }

    #[test]
    fn parses_get_reply_and_strips_id() {
        let body = r#"[{"demo-m": {"name": "demo", "round": 4, "id": "abc123", "date": "2024"}},
                       {"demo-m": {"name": "demo", "round": 5, "id": "def456"}}]"#;
        let recs = parse_records(body).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].id.as_deref(), Some("abc123"));
        assert!(!recs[0].attributes.contains_key("id"));
        assert_eq!(Marker::from_record(&recs[1]).unwrap(), Marker { name: "demo".into(), round: 5 });
        assert!(parse_records("").unwrap().is_empty());
        assert!(parse_records("[]").unwrap().is_empty());
        assert!(parse_records("[1]").is_err());
    }

    #[test]
    fn parses_counts_in_every_shape() {
        assert_eq!(parse_count("3").unwrap(), 3);
        assert_eq!(parse_count("\"2\"").unwrap(), 2);
        assert_eq!(parse_count(r#"[{"a":{}},{"b":{}}]"#).unwrap(), 2);
        assert_eq!(parse_count(" 7 \n").unwrap(), 7);
        assert_eq!(parse_count("").unwrap(), 0);
        assert!(parse_count("many").is_err());
    }
}
