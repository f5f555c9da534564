// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An authenticated JSON client for the Google Cloud REST APIs.

use google_cloud_auth::credentials::{CacheableResource, Credentials};
use http::Extensions;
use serde_json::Value;
use wif_provisioner::Result;
use wif_provisioner::error::{Code, Error, Status};

#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    cred: Credentials,
}

impl HttpClient {
    pub fn new(cred: Credentials) -> Self {
        Self {
            inner: reqwest::Client::new(),
            cred,
        }
    }

    pub fn builder(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.inner.request(method, url)
    }

    /// Sends a single request and returns the decoded JSON body.
    ///
    /// Empty responses are returned as [Value::Null].
    pub async fn execute(
        &self,
        mut builder: reqwest::RequestBuilder,
        body: Option<&Value>,
    ) -> Result<Value> {
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let cached_auth_headers = self
            .cred
            .headers(Extensions::new())
            .await
            .map_err(Error::authentication)?;
        let auth_headers = match cached_auth_headers {
            CacheableResource::New { data, .. } => data,
            CacheableResource::NotModified => {
                unreachable!("headers are not cached");
            }
        };
        for (key, value) in auth_headers.iter() {
            builder = builder.header(key, value);
        }
        let response = builder.send().await.map_err(map_send_error)?;
        if !response.status().is_success() {
            return Err(to_http_error(response).await);
        }
        let body = response.bytes().await.map_err(map_send_error)?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(Error::io)
    }
}

fn map_send_error(err: reqwest::Error) -> Error {
    match err {
        e if e.is_timeout() => Error::timeout(e),
        e => Error::io(e),
    }
}

/// Converts an unsuccessful response into an [Error].
pub async fn to_http_error(response: reqwest::Response) -> Error {
    let status_code = response.status().as_u16();
    match response.bytes().await {
        Ok(body) => Error::service(parse_status(status_code, &body)),
        Err(e) => map_send_error(e),
    }
}

/// Parses the error payload returned by Google Cloud services.
///
/// The payload follows [AIP-193]. The HTTP status code is used when the body
/// cannot be parsed, or when it does not name a canonical code.
///
/// [AIP-193]: https://google.aip.dev/193
pub fn parse_status(status_code: u16, body: &bytes::Bytes) -> Status {
    let fallback = code_from_http_status(status_code);
    match Status::try_from(body) {
        Ok(status) if status.code == Code::Unknown => status.set_code(fallback),
        Ok(status) => status,
        Err(_) => Status::default()
            .set_code(fallback)
            .set_message(String::from_utf8_lossy(body)),
    }
}

/// Maps an HTTP status code to the closest canonical code.
///
/// See <https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto>.
pub fn code_from_http_status(status_code: u16) -> Code {
    match status_code {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        412 => Code::FailedPrecondition,
        416 => Code::OutOfRange,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        500..=599 => Code::Internal,
        _ => Code::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;
    use wif_provisioner::error::{ErrorKind, reason};

    type TestResult = anyhow::Result<()>;

    fn client() -> HttpClient {
        HttpClient::new(google_cloud_auth::credentials::anonymous::Builder::new().build())
    }

    fn body(value: serde_json::Value) -> bytes::Bytes {
        bytes::Bytes::from(value.to_string())
    }

    #[test]
    fn aip193() {
        let body = body(json!({
            "error": {
                "code": 403,
                "message": "Permission 'iam.serviceAccounts.create' denied",
                "status": "PERMISSION_DENIED",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                    "reason": "IAM_PERMISSION_DENIED",
                    "domain": "iam.googleapis.com"
                }]
            }
        }));
        let status = parse_status(403, &body);
        assert_eq!(status.code, Code::PermissionDenied);
        assert_eq!(status.message, "Permission 'iam.serviceAccounts.create' denied");
        assert_eq!(reason(&status), Some("IAM_PERMISSION_DENIED"));
        assert_eq!(status.details.len(), 1, "{status:?}");
    }

    #[test]
    fn quota() {
        let status = parse_status(
            429,
            &body(json!({
                "error": {
                    "code": 429,
                    "message": "Quota exceeded",
                    "status": "RESOURCE_EXHAUSTED",
                    "details": [{
                        "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                        "reason": "RATE_LIMIT_EXCEEDED"
                    }, {
                        "@type": "type.googleapis.com/google.rpc.Help"
                    }]
                }
            })),
        );
        assert_eq!(Error::service(status).kind(), ErrorKind::Transient);

        let status = parse_status(
            429,
            &body(json!({
                "error": {
                    "code": 429,
                    "status": "RESOURCE_EXHAUSTED",
                    "details": [{
                        "@type": "type.googleapis.com/google.rpc.ErrorInfo",
                        "reason": "QUOTA_EXCEEDED"
                    }]
                }
            })),
        );
        assert_eq!(Error::service(status).kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn missing_status_name() {
        let status = parse_status(
            409,
            &body(json!({
                "error": {
                    "code": 409,
                    "message": "You already own this bucket.",
                    "errors": [{"domain": "global", "reason": "conflict"}]
                }
            })),
        );
        assert_eq!(status.code, Code::Aborted);
        assert_eq!(status.message, "You already own this bucket.");
    }

    #[test_case(503, "upstream connect error", Code::Unavailable)]
    #[test_case(404, "", Code::NotFound)]
    #[test_case(500, "{\"unexpected\": true}", Code::Internal)]
    fn not_a_status(status_code: u16, body: &str, want: Code) {
        let status = parse_status(status_code, &bytes::Bytes::from(body.to_string()));
        assert_eq!(status.code, want);
    }

    #[test_case(400, Code::InvalidArgument)]
    #[test_case(401, Code::Unauthenticated)]
    #[test_case(403, Code::PermissionDenied)]
    #[test_case(404, Code::NotFound)]
    #[test_case(409, Code::Aborted)]
    #[test_case(412, Code::FailedPrecondition)]
    #[test_case(429, Code::ResourceExhausted)]
    #[test_case(502, Code::Internal)]
    #[test_case(503, Code::Unavailable)]
    #[test_case(504, Code::DeadlineExceeded)]
    #[test_case(302, Code::Unknown)]
    fn http_status(status_code: u16, want: Code) {
        assert_eq!(code_from_http_status(status_code), want);
    }

    #[tokio::test]
    async fn execute_success() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/things"),
                request::body(json_decoded(eq(json!({"name": "thing"})))),
            ])
            .respond_with(json_encoded(json!({"name": "thing", "id": 42}))),
        );
        let client = client();
        let builder = client.builder(
            reqwest::Method::POST,
            format!("http://{}/v1/things", server.addr()),
        );
        let got = client.execute(builder, Some(&json!({"name": "thing"}))).await?;
        assert_eq!(got, json!({"name": "thing", "id": 42}));
        Ok(())
    }

    #[tokio::test]
    async fn execute_empty() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("DELETE", "/v1/things/42"))
                .respond_with(status_code(204)),
        );
        let client = client();
        let builder = client.builder(
            reqwest::Method::DELETE,
            format!("http://{}/v1/things/42", server.addr()),
        );
        let got = client.execute(builder, None).await?;
        assert_eq!(got, Value::Null);
        Ok(())
    }

    #[tokio::test]
    async fn execute_error() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/things/missing")).respond_with(
                status_code(404).body(
                    json!({"error": {"code": 404, "message": "missing", "status": "NOT_FOUND"}})
                        .to_string(),
                ),
            ),
        );
        let client = client();
        let builder = client.builder(
            reqwest::Method::GET,
            format!("http://{}/v1/things/missing", server.addr()),
        );
        let err = client.execute(builder, None).await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
        assert_eq!(err.status().map(|s| s.message.as_str()), Some("missing"));
        Ok(())
    }

    #[tokio::test]
    async fn execute_unreachable() -> TestResult {
        let server = Server::run();
        let url = format!("http://{}/v1/things", server.addr());
        drop(server);
        let client = client();
        let err = client
            .execute(client.builder(reqwest::Method::GET, url), None)
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
        Ok(())
    }
}
