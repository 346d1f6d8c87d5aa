//! JSON payload codec. Every payload crossing the engine boundary (workflow
//! input, activity input/result, signal payloads, status projections) is a
//! `String`; typed APIs encode and decode through here.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
}

pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String> {
    serde_json::from_str(payload).map_err(|e| format!("decode: {e}"))
}
