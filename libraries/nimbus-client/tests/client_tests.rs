//! Tests for the Nimbus cloud client against a mock service.
//!
//! Every scenario runs once per transport backend so both are held to the
//! same observable behaviour.

use nimbus_client::{
    ClientConfig, CloudClient, CloudError, TokenPhase, TransportBackend, TransportErrorKind,
    UploadState,
};
use serde_json::json;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_string, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BACKENDS: [TransportBackend; 2] = [TransportBackend::Pooled, TransportBackend::PerRequest];

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn config_for(server: &MockServer, backend: TransportBackend) -> ClientConfig {
    config_for_uri(server.uri(), backend)
}

fn config_for_uri(uri: String, backend: TransportBackend) -> ClientConfig {
    init_tracing();

    let mut config = ClientConfig::for_host(uri);
    config.transport = backend;
    config.chunk_size = 4;
    config.retry_base_delay_ms = 10;
    config.retry_max_delay_ms = 40;
    config.request_timeout_secs = 1;
    config.connect_timeout_secs = 1;
    config
}

/// Client holding a token the service accepts.
fn authorized_client(server: &MockServer, backend: TransportBackend) -> CloudClient {
    let config = config_for(server, backend).with_tokens(Some("live".into()), "r1");
    CloudClient::new(config).unwrap()
}

fn ok_body(body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "email": "user@example.com",
        "status": 200,
        "body": body
    }))
}

// =============================================================================
// Token Refresh Tests
// =============================================================================

mod token_refresh {
    use super::*;

    #[tokio::test]
    async fn test_refresh_request_shape() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .and(header("content-type", "application/x-www-form-urlencoded"))
                .and(header("accept", "*/*"))
                .and(body_string(
                    "client_id=cloud-win&grant_type=refresh_token&refresh_token=r1",
                ))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "access_token": "fresh",
                    "expires_in": 3600
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client =
                CloudClient::new(config_for(&server, backend).with_tokens(None, "r1")).unwrap();
            assert_eq!(client.auth_status().await, TokenPhase::Expiring);

            let token = client.tokens().valid_token().await.unwrap();
            assert_eq!(token, "fresh", "backend {:?}", backend);
            assert_eq!(client.auth_status().await, TokenPhase::Valid);
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_trigger_one_refresh() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"access_token": "shared", "expires_in": 3600}))
                        .set_delay(Duration::from_millis(200)),
                )
                .expect(1)
                .mount(&server)
                .await;

            let client = Arc::new(
                CloudClient::new(config_for(&server, backend).with_tokens(None, "r1")).unwrap(),
            );

            let handles: Vec<_> = (0..5)
                .map(|_| {
                    let client = client.clone();
                    tokio::spawn(async move { client.tokens().valid_token().await })
                })
                .collect();

            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap(), "shared");
            }
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_error_payload_with_ok_status_fails() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "error": "invalid_grant",
                    "error_code": 6,
                    "error_description": "refresh token revoked"
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client =
                CloudClient::new(config_for(&server, backend).with_tokens(None, "r1")).unwrap();

            match client.tokens().valid_token().await {
                Err(CloudError::Auth(msg)) => assert!(msg.contains("revoked")),
                other => panic!("Expected Auth error, got: {:?}", other),
            }
            assert_eq!(client.auth_status().await, TokenPhase::Failed);

            // Sticky: no second request until new credentials arrive.
            assert!(client.list("/").await.unwrap_err().requires_reauthentication());
            server.verify().await;
        }
    }
}

// =============================================================================
// Request Pipeline Tests
// =============================================================================

mod pipeline {
    use super::*;

    fn listing() -> serde_json::Value {
        json!({
            "name": "Music",
            "home": "/Music",
            "count": {"folders": 0, "files": 1},
            "list": [{"name": "a.flac", "home": "/Music/a.flac", "type": "file", "size": 3}]
        })
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_and_request_retried() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v2/folder"))
                .and(header("authorization", "Bearer stale"))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"access_token": "fresh", "expires_in": 3600})),
                )
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/v2/folder"))
                .and(query_param("home", "/Music"))
                .and(header("authorization", "Bearer fresh"))
                .respond_with(ok_body(listing()))
                .expect(1)
                .mount(&server)
                .await;

            let config = config_for(&server, backend).with_tokens(Some("stale".into()), "r1");
            let client = CloudClient::new(config).unwrap();

            let listing = client.list("/Music").await.unwrap();
            assert_eq!(listing.entry("a.flac").map(|e| e.size), Some(3));
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_second_rejection_is_auth_error() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v2/folder"))
                .respond_with(ResponseTemplate::new(401))
                .expect(2)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({"access_token": "fresh", "expires_in": 3600})),
                )
                .expect(1)
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            match client.list("/Music").await {
                Err(CloudError::Auth(_)) => {}
                other => panic!("Expected Auth error, got: {:?}", other),
            }
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced_not_retried() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v2/folder/add"))
                .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                    "error": "unavailable",
                    "message": "try later"
                })))
                .expect(1)
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            match client.create_folder("/New").await {
                Err(CloudError::RemoteRejected {
                    status,
                    code,
                    message,
                }) => {
                    assert_eq!(status, 503);
                    assert_eq!(code.as_deref(), Some("unavailable"));
                    assert_eq!(message, "try later");
                }
                other => panic!("Expected RemoteRejected, got: {:?}", other),
            }
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_decode_error() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/v2/folder"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
                .expect(1)
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            assert!(matches!(
                client.list("/").await,
                Err(CloudError::Decode(_))
            ));
            server.verify().await;
        }
    }
}

// =============================================================================
// Upload Tests
// =============================================================================

mod upload {
    use super::*;

    async fn mount_chunk(server: &MockServer, range: &str, body: &str, ack: &str) {
        Mock::given(method("PUT"))
            .and(path("/upload/Music/set.flac"))
            .and(header("content-range", range))
            .and(header("content-type", "application/octet-stream"))
            .and(body_string(body))
            .respond_with(ResponseTemplate::new(201).set_body_string(ack))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_chunks_are_sent_in_order_with_ranges() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            mount_chunk(&server, "bytes 0-3/10", "ABCD", "").await;
            mount_chunk(&server, "bytes 4-7/10", "EFGH", "").await;
            mount_chunk(&server, "bytes 8-9/10", "IJ", "HASH10").await;

            let client = authorized_client(&server, backend);
            let mut stream = client
                .open_upload_stream("/Music/set.flac", 10)
                .await
                .unwrap();
            stream.write(b"ABCDEFGHIJ").await.unwrap();
            let receipt = stream.close().await.unwrap();

            assert_eq!(stream.state(), UploadState::Completed);
            assert_eq!(stream.bytes_written(), 10);
            assert_eq!(receipt.chunks, 3);
            assert_eq!(receipt.last_ack.as_deref(), Some("HASH10"));
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_timed_out_chunk_is_resent() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("PUT"))
                .and(path("/upload/Music/set.flac"))
                .and(header("content-range", "bytes 0-3/4"))
                .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(1500)))
                .up_to_n_times(1)
                .expect(1)
                .mount(&server)
                .await;
            mount_chunk(&server, "bytes 0-3/4", "WXYZ", "ok").await;

            let client = authorized_client(&server, backend);
            let mut stream = client
                .open_upload_stream("/Music/set.flac", 4)
                .await
                .unwrap();
            stream.write(b"WXYZ").await.unwrap();
            assert_eq!(stream.acknowledged(), 4);
            stream.close().await.unwrap();
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_offset() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            mount_chunk(&server, "bytes 0-3/8", "1234", "").await;
            Mock::given(method("PUT"))
                .and(path("/upload/Music/set.flac"))
                .and(header("content-range", "bytes 4-7/8"))
                .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(1500)))
                .expect(2)
                .mount(&server)
                .await;

            let mut config = config_for(&server, backend).with_tokens(Some("live".into()), "r1");
            config.max_chunk_attempts = 2;
            let client = CloudClient::new(config).unwrap();

            let mut stream = client
                .open_upload_stream("/Music/set.flac", 8)
                .await
                .unwrap();
            let err = stream.write(b"12345678").await.unwrap_err();

            assert_eq!(err.acknowledged_offset(), Some(4), "got {:?}", err);
            assert_eq!(stream.state(), UploadState::Aborted);
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_finalize_registers_file() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("PUT"))
                .and(path("/upload/Docs/notes.txt"))
                .respond_with(ResponseTemplate::new(201).set_body_string("C0FFEE"))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v2/file/add"))
                .and(body_string_contains("hash=C0FFEE"))
                .and(body_string_contains("size=3"))
                .respond_with(ok_body(json!("/Docs/notes (1).txt")))
                .expect(1)
                .mount(&server)
                .await;

            let mut config = config_for(&server, backend).with_tokens(Some("live".into()), "r1");
            config.finalize_endpoint = Some("file/add".into());
            let client = CloudClient::new(config).unwrap();

            let mut reader: &[u8] = b"abc";
            let receipt = client
                .upload_reader(&mut reader, "/Docs/notes.txt", 3)
                .await
                .unwrap();
            assert_eq!(receipt.committed_path.as_deref(), Some("/Docs/notes (1).txt"));
            server.verify().await;
        }
    }
}

// =============================================================================
// Action Tests
// =============================================================================

mod actions {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_unpublish() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v2/file/publish"))
                .and(body_string("home=%2FMusic%2Fa.flac"))
                .respond_with(ok_body(json!("Xy12/abc")))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/v2/file/unpublish"))
                .and(body_string("weblink=Xy12%2Fabc"))
                .respond_with(ok_body(json!("Xy12/abc")))
                .expect(1)
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            let link = client.publish("/Music/a.flac").await.unwrap();
            assert_eq!(link.url, format!("{}/public/Xy12/abc", server.uri()));
            client.unpublish(&link.weblink).await.unwrap();
            server.verify().await;
        }
    }

    #[tokio::test]
    async fn test_remove_missing_entry_is_rejected() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v2/file/remove"))
                .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                    "status": 404,
                    "error": "not_exists"
                })))
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            match client.remove("/gone").await {
                Err(CloudError::RemoteRejected { status: 404, code, .. }) => {
                    assert_eq!(code.as_deref(), Some("not_exists"));
                }
                other => panic!("Expected RemoteRejected, got: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_download_streams_to_disk() {
        for backend in BACKENDS {
            let server = MockServer::start().await;
            let payload = vec![7u8; 64 * 1024];
            Mock::given(method("GET"))
                .and(path("/get/Music/a.flac"))
                .and(header("authorization", "Bearer live"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
                .expect(1)
                .mount(&server)
                .await;

            let client = authorized_client(&server, backend);
            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("a.flac");
            let mut last_progress = 0.0f32;

            let size = client
                .download("/Music/a.flac", &dest, |p| last_progress = p.progress)
                .await
                .unwrap();

            assert_eq!(size, payload.len() as u64);
            assert_eq!(std::fs::read(&dest).unwrap(), payload);
            assert!((last_progress - 1.0).abs() < f32::EPSILON);
            server.verify().await;
        }
    }
}

// =============================================================================
// Transport Parity Tests
// =============================================================================

mod transport_parity {
    use super::*;

    /// Serve one response of ten bytes, pausing for `pause` after the first five.
    async fn slow_body_server(pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n01234",
                )
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(pause).await;
            socket.write_all(b"56789").await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_slow_body_outlasts_request_timeout_on_both_backends() {
        for backend in BACKENDS {
            // request_timeout_secs is 1; the body stalls longer than that.
            let uri = slow_body_server(Duration::from_millis(1500)).await;
            let config = config_for_uri(uri, backend).with_tokens(Some("live".into()), "r1");
            let client = CloudClient::new(config).unwrap();

            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("slow.bin");

            match client.download("/slow.bin", &dest, |_| {}).await {
                Ok(size) => assert_eq!(size, 10, "backend {:?}", backend),
                other => panic!("Expected Ok(10) on {:?}, got: {:?}", backend, other),
            }
            assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out_on_both_backends() {
        for backend in BACKENDS {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let uri = format!("http://{}", listener.local_addr().unwrap());
            tokio::spawn(async move {
                // Accept and never answer.
                let (_socket, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            });

            let config = config_for_uri(uri, backend).with_tokens(Some("live".into()), "r1");
            let client = CloudClient::new(config).unwrap();
            let dir = tempfile::tempdir().unwrap();

            match client
                .download("/never.bin", &dir.path().join("never.bin"), |_| {})
                .await
            {
                Err(CloudError::Transport { kind, .. }) => {
                    assert_eq!(kind, TransportErrorKind::Timeout, "backend {:?}", backend);
                }
                other => panic!("Expected timeout on {:?}, got: {:?}", backend, other),
            }
        }
    }
}
