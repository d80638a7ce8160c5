//! Verify outbound building and response normalisation against the JSON
//! test vectors stored in `test-vectors/`.
//!
//! Each vector file describes inputs as they cross the relay channel and
//! the expected result. Envelopes are compared as parsed JSON (not raw
//! strings), which avoids false negatives from field ordering.

use std::time::Duration;

use bytes::Bytes;
use imgrelay_core::endpoint::{build_outbound, ExecPolicy};
use imgrelay_core::fetch::{Credentials, FetchedResponse, MultipartField, OutboundBody};
use imgrelay_core::{HttpReply, RelayConfig, RequestDescriptor, ResponseType};
use serde_json::Value;

fn policy() -> ExecPolicy {
    ExecPolicy {
        fixed_headers: RelayConfig::default().fixed_headers(),
        credentials: None,
        timeout: Duration::from_secs(30),
    }
}

fn pairs(value: &Value) -> Vec<(String, String)> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|h| {
            let arr = h.as_array().unwrap();
            (arr[0].as_str().unwrap().to_string(), arr[1].as_str().unwrap().to_string())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Outbound requests
// ---------------------------------------------------------------------------

#[test]
fn descriptor_test_vectors() {
    let raw = include_str!("../../test-vectors/descriptors.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let descriptor: RequestDescriptor = serde_json::from_value(case["descriptor"].clone()).unwrap();
        let expected = &case["expected"];

        let request = build_outbound(descriptor, &policy()).unwrap();
        assert_eq!(serde_json::to_value(request.method).unwrap(), expected["method"], "{name}: method");
        assert_eq!(request.url, expected["url"].as_str().unwrap(), "{name}: url");
        assert_eq!(request.headers, pairs(&expected["headers"]), "{name}: headers");

        let credentials = match request.credentials {
            Credentials::Include => "include",
            Credentials::Omit => "omit",
        };
        assert_eq!(credentials, expected["credentials"], "{name}: credentials");

        match (&request.body, expected["body"].as_str().unwrap()) {
            (OutboundBody::Empty, "empty") => {}
            (OutboundBody::Raw(raw), "raw") => assert_eq!(raw, expected["raw"].as_str().unwrap(), "{name}: raw"),
            (OutboundBody::Multipart(fields), "multipart") => {
                let expected_parts = expected["parts"].as_array().unwrap();
                assert_eq!(fields.len(), expected_parts.len(), "{name}: part count");
                for (field, part) in fields.iter().zip(expected_parts) {
                    assert_eq!(field.key(), part["key"].as_str().unwrap(), "{name}: key");
                    match field {
                        MultipartField::Text { value, .. } => {
                            assert_eq!(value, part["value"].as_str().unwrap(), "{name}: text value")
                        }
                        MultipartField::File {
                            file_name,
                            mime,
                            bytes,
                            ..
                        } => {
                            assert_eq!(file_name, part["file_name"].as_str().unwrap(), "{name}: file name");
                            assert_eq!(mime, part["mime"].as_str().unwrap(), "{name}: mime");
                            assert_eq!(&bytes[..], part["bytes"].as_str().unwrap().as_bytes(), "{name}: bytes");
                        }
                    }
                }
            }
            (body, kind) => panic!("{name}: expected {kind} body, got {body:?}"),
        }
    }
}

#[test]
fn undecodable_file_part_is_rejected() {
    let descriptor: RequestDescriptor = serde_json::from_value(serde_json::json!({
        "method": "POST",
        "url": "https://api.nodeimage.com/api/upload",
        "body": { "parts": [
            { "kind": "file", "key": "image", "fileName": "a.png", "mime": "image/png", "encodedBytes": "***", "lastModified": 0 }
        ] }
    }))
    .unwrap();
    let err = build_outbound(descriptor, &policy()).unwrap_err();
    assert!(err.to_string().starts_with("invalid file payload"), "{err}");
}

// ---------------------------------------------------------------------------
// Response normalisation
// ---------------------------------------------------------------------------

#[test]
fn normalize_test_vectors() {
    let raw = include_str!("../../test-vectors/normalize.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let response_type: ResponseType = serde_json::from_value(case["response_type"].clone()).unwrap();
        let response = &case["response"];

        let fetched = FetchedResponse {
            status: response["status"].as_u64().unwrap() as u16,
            status_text: response["status_text"].as_str().unwrap().to_string(),
            headers: pairs(&response["headers"]),
            body: Bytes::from(response["body"].as_str().unwrap().to_string()),
        };

        let reply = HttpReply::from_fetched(fetched, response_type);
        let actual = serde_json::to_value(&reply).unwrap();
        assert_eq!(actual, case["expected"], "{name}: envelope");
    }
}
