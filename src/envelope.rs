//! JSON request/response envelopes carried over mux data frames.
//!
//! Every envelope is a single JSON object tagged by its `request` field.
//! Requests flow client → server; responses flow back on the same stream.
//! Long-lived tails reuse the `pipe` shape in both directions: the server
//! tail delivers CSV fragments as `pipe` responses, the local tail sends
//! CSV fragments as `pipe` requests and receives checkpoint acks.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Result encoding requested for a one-shot query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    Raw,
    Json,
}

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum Request {
    /// One-shot SQL query.
    Query { query: String, format: QueryFormat },

    /// Fetch schema DDL for a table, a view, or everything.
    Schema {
        #[serde(skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        view: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        suffix: Option<String>,
    },

    /// Subscribe to server → client changes for a table, resuming after
    /// the given watermark.
    Tail { table: String, since: u64 },

    /// Open the client → server change channel for a table.
    Write { table: String },

    /// A change fragment on an established write channel.
    Pipe { data: String },

    /// Provision a database on the server.
    CreateDatabase { name: String },

    /// Provision a user; the reply is a `credentials` response.
    CreateUser {},

    /// Legacy JSON authentication for the single-envelope path.
    #[serde(rename_all = "camelCase")]
    Auth {
        access_key: String,
        date: String,
        nonce: String,
        signature: String,
        device_uuid: String,
    },
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum Response {
    /// Data fragment (query results, schema DDL, tail CSV).
    Pipe { data: String },

    /// Server-side failure for the issuing stream.
    Error { msg: String },

    /// Reply to `createUser`.
    #[serde(rename_all = "camelCase")]
    Credentials {
        access_key: String,
        private_key: String,
        device_uuid: String,
    },
}

impl Request {
    /// Serialize to the bytes carried in a data frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Response {
    /// Deserialize from the bytes of a data frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_wire_shape() {
        let req = Request::Tail {
            table: "todos".to_string(),
            since: 42,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"request":"tail","table":"todos","since":42}"#);
    }

    #[test]
    fn test_write_wire_shape() {
        let req = Request::Write {
            table: "todos".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"request":"write","table":"todos"}"#);
    }

    #[test]
    fn test_pipe_roundtrip() {
        let req = Request::Pipe {
            data: "1,\"milk\"\n".to_string(),
        };
        let bytes = req.to_bytes().unwrap();
        let parsed: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_query_format_lowercase() {
        let req = Request::Query {
            query: "select 1;".to_string(),
            format: QueryFormat::Json,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""format":"json""#));
        assert!(json.starts_with(r#"{"request":"query""#));
    }

    #[test]
    fn test_schema_omits_absent_fields() {
        let req = Request::Schema {
            table: Some("todos".to_string()),
            view: None,
            suffix: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"request":"schema","table":"todos"}"#);

        // Missing optional fields deserialize to None.
        let parsed: Request = serde_json::from_str(r#"{"request":"schema"}"#).unwrap();
        assert_eq!(
            parsed,
            Request::Schema {
                table: None,
                view: None,
                suffix: None
            }
        );
    }

    #[test]
    fn test_create_database_camel_case_tag() {
        let req = Request::CreateDatabase {
            name: "db1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"request":"createDatabase","name":"db1"}"#);
    }

    #[test]
    fn test_create_user_empty_body() {
        let req = Request::CreateUser {};
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"request":"createUser"}"#);
    }

    #[test]
    fn test_auth_camel_case_fields() {
        let req = Request::Auth {
            access_key: "ABCDEFGHIJKLMNOPQRST".to_string(),
            date: "2024-01-02T03:04:05.678Z".to_string(),
            nonce: "AAECAwQFBgc=".to_string(),
            signature: "c2ln".to_string(),
            device_uuid: "dev-1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""request":"auth""#));
        assert!(json.contains(r#""accessKey":"ABCDEFGHIJKLMNOPQRST""#));
        assert!(json.contains(r#""deviceUuid":"dev-1""#));
    }

    #[test]
    fn test_response_pipe_roundtrip() {
        let bytes = br#"{"request":"pipe","data":"1,\"milk\"\n"}"#;
        let resp = Response::from_bytes(bytes).unwrap();
        assert_eq!(
            resp,
            Response::Pipe {
                data: "1,\"milk\"\n".to_string()
            }
        );
    }

    #[test]
    fn test_response_error_shape() {
        let resp = Response::Error {
            msg: "no such table".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"request":"error","msg":"no such table"}"#);
    }

    #[test]
    fn test_response_credentials_camel_case() {
        let bytes = br#"{"request":"credentials","accessKey":"k","privateKey":"cGs=","deviceUuid":"d"}"#;
        let resp = Response::from_bytes(bytes).unwrap();
        assert_eq!(
            resp,
            Response::Credentials {
                access_key: "k".to_string(),
                private_key: "cGs=".to_string(),
                device_uuid: "d".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_request_kind_rejected() {
        let err = serde_json::from_str::<Request>(r#"{"request":"mystery"}"#);
        assert!(err.is_err());
    }
}
