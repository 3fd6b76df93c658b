use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const HEADER: &str = "Content-Length: ";
const SEPARATOR: &[u8] = b"\r\n\r\n";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Response {
    /// Numeric id, when the response carries one
    pub fn id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(e) => Err(Error::Rpc {
                code: e.code,
                message: e.message,
                data: e.data,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Frame a request as `Content-Length: <bytes>\r\n\r\n<json>`
pub fn encode(request: &Request) -> Result<String> {
    let body = serde_json::to_string(request)?;
    Ok(format!("{HEADER}{}\r\n\r\n{body}", body.len()))
}

/// Reassembles frames that arrive split across several messages
#[derive(Debug, Default)]
pub struct FrameDecoder {
    expected: Option<usize>,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound message. Returns a response once a full body is
    /// available; malformed frames are logged and dropped.
    pub fn push(&mut self, data: &[u8]) -> Option<Response> {
        if let Some(expected) = self.expected {
            self.buffer.extend_from_slice(data);
            if self.buffer.len() < expected {
                return None;
            }
            self.expected = None;
            let body = std::mem::take(&mut self.buffer);
            return parse_body(&body[..expected]);
        }

        let Some(rest) = data.strip_prefix(HEADER.as_bytes()) else {
            return parse_body(data);
        };
        let Some(split) = rest.windows(SEPARATOR.len()).position(|w| w == SEPARATOR) else {
            warn!("Dropping frame with unterminated Content-Length header");
            return None;
        };
        let length = std::str::from_utf8(&rest[..split])
            .ok()
            .and_then(|n| n.trim().parse::<usize>().ok());
        let Some(length) = length else {
            warn!("Dropping frame with bad Content-Length header");
            return None;
        };

        let body = &rest[split + SEPARATOR.len()..];
        if body.len() < length {
            self.expected = Some(length);
            self.buffer = body.to_vec();
            return None;
        }
        parse_body(&body[..length])
    }
}

fn parse_body(body: &[u8]) -> Option<Response> {
    match serde_json::from_slice(body) {
        Ok(response) => Some(response),
        Err(e) => {
            warn!("Dropping undecodable RPC frame: {}", e);
            None
        }
    }
}
