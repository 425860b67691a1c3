//! HTTP client for the external recognition service.

use async_trait::async_trait;
use rollcall_core::{
    Identity, Match, Recognition, RecognitionError, RecognitionRequest, RecognitionService,
};
use serde::Deserialize;
use std::time::Duration;

/// Service response, tagged by `status`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RecognizeResponse {
    Matched {
        identity_id: String,
        identity_name: String,
        confidence: f32,
        /// Absent means the service made no liveness claim.
        #[serde(default)]
        liveness: bool,
    },
    NoMatch,
    Error {
        reason: String,
    },
}

impl From<RecognizeResponse> for Result<Recognition, RecognitionError> {
    fn from(response: RecognizeResponse) -> Self {
        match response {
            RecognizeResponse::Matched {
                identity_id,
                identity_name,
                confidence,
                liveness,
            } => Ok(Recognition::Matched(Match {
                identity: Identity {
                    id: identity_id,
                    name: identity_name,
                },
                confidence,
                liveness,
            })),
            RecognizeResponse::NoMatch => Ok(Recognition::NoMatch),
            RecognizeResponse::Error { reason } => Err(RecognitionError::Service(reason)),
        }
    }
}

/// `POST {base}/recognize?max_faces=N` with the JPEG as the body.
pub struct HttpRecognitionService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecognitionService {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/recognize", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RecognitionService for HttpRecognitionService {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition, RecognitionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("max_faces", request.max_faces)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(request.frame.jpeg)
            .send()
            .await
            .map_err(|e| RecognitionError::Service(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecognitionError::Service(format!(
                "service returned HTTP {status}"
            )));
        }

        let body: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| RecognitionError::Service(format!("malformed response: {e}")))?;
        tracing::debug!(?body, "recognition response");
        body.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::StillFrame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn parse(json: &str) -> Result<Recognition, RecognitionError> {
        serde_json::from_str::<RecognizeResponse>(json).unwrap().into()
    }

    fn request() -> RecognitionRequest {
        RecognitionRequest {
            frame: StillFrame {
                jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
                width: 2,
                height: 2,
                captured_at: Utc::now(),
            },
            max_faces: 3,
        }
    }

    /// Accept one connection, reply with `status_line` and `body`, and hand
    /// back the raw request bytes.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
                if let Some(end) = req.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&req[..end]).to_lowercase();
                    let len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if req.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let reply = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            req
        });
        (format!("http://{addr}/"), task)
    }

    #[test]
    fn test_parse_matched() {
        let result = parse(
            r#"{"status":"matched","identity_id":"STU001","identity_name":"Ada","confidence":0.93,"liveness":true}"#,
        );
        let Ok(Recognition::Matched(m)) = result else {
            panic!("expected a match, got {result:?}");
        };
        assert_eq!(m.identity.id, "STU001");
        assert!((m.confidence - 0.93).abs() < 1e-6);
        assert!(m.liveness);
    }

    #[test]
    fn test_missing_liveness_is_not_live() {
        let result = parse(
            r#"{"status":"matched","identity_id":"STU002","identity_name":"Bo","confidence":0.9}"#,
        );
        assert!(matches!(result, Ok(Recognition::Matched(Match { liveness: false, .. }))));
    }

    #[test]
    fn test_parse_no_match_and_error() {
        assert_eq!(parse(r#"{"status":"no_match"}"#), Ok(Recognition::NoMatch));
        assert_eq!(
            parse(r#"{"status":"error","reason":"model not loaded"}"#),
            Err(RecognitionError::Service("model not loaded".into()))
        );
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(serde_json::from_str::<RecognizeResponse>(r#"{"status":"maybe"}"#).is_err());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let service = HttpRecognitionService::new("http://localhost:8000/").unwrap();
        assert_eq!(service.endpoint(), "http://localhost:8000/recognize");
    }

    #[tokio::test]
    async fn test_posts_jpeg_and_parses_reply() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"status":"matched","identity_id":"STU001","identity_name":"Ada","confidence":0.95,"liveness":true}"#,
        )
        .await;
        let service = HttpRecognitionService::new(&url).unwrap();

        let result = service.recognize(request()).await;
        assert!(matches!(result, Ok(Recognition::Matched(_))), "{result:?}");

        let raw = server.await.unwrap();
        let text = String::from_utf8_lossy(&raw).to_lowercase();
        assert!(text.starts_with("post /recognize?max_faces=3 "), "{text}");
        assert!(text.contains("content-type: image/jpeg"));
        assert!(raw.ends_with(&[0xFF, 0xD8, 0xFF, 0xD9]));
    }

    #[tokio::test]
    async fn test_http_error_is_service_error() {
        let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable", "{}").await;
        let service = HttpRecognitionService::new(&url).unwrap();

        let result = service.recognize(request()).await;
        assert!(
            matches!(&result, Err(RecognitionError::Service(msg)) if msg.contains("503")),
            "{result:?}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_service_is_service_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let service = HttpRecognitionService::new(&format!("http://{addr}")).unwrap();
        let result = service.recognize(request()).await;
        assert!(matches!(result, Err(RecognitionError::Service(_))));
    }
}
