//! Phase-timed probes against a local mock server.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use rcgen::CertifiedKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_agent::request_timer::{RequestConfig, RequestTimer};

fn get(url: String) -> RequestConfig {
    RequestConfig {
        id: json!(1),
        url: Some(url),
        ..Default::default()
    }
}

#[tokio::test]
async fn plain_get_reports_phases_without_tls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let record = RequestTimer::new()
        .execute(&get(format!("{}/health", server.uri())))
        .await;

    assert_eq!(record.error, None);
    assert_eq!(record.id, json!(1));
    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.status_message.as_deref(), Some("OK"));
    assert_eq!(record.http_version.as_deref(), Some("1.1"));
    assert_eq!(record.local_address.as_deref(), Some("127.0.0.1"));
    assert!(record.local_port.is_some());

    let phases = &record.timing_phases;
    assert!(phases.dns_lookup.is_some());
    assert!(phases.tcp_connection.is_some());
    assert!(phases.tls_handshake.is_none());
    assert!(phases.first_byte.is_some());
    assert!(phases.content_transfer.is_some());
    assert!(
        (phases.sum_of_phases() - phases.total).abs() < 0.5,
        "phases {} vs total {}",
        phases.sum_of_phases(),
        phases.total
    );
    assert!(record.timings.secure_connect.is_none());

    let json = serde_json::to_value(&record).unwrap();
    assert!(json["timingPhases"].get("tlsHandshake").is_none());
}

#[tokio::test]
async fn body_is_kept_only_when_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello fleet"))
        .mount(&server)
        .await;

    let timer = RequestTimer::new();
    let mut config = get(format!("{}/", server.uri()));

    let without = timer.execute(&config).await;
    assert_eq!(without.body, None);
    assert!(without.timing_phases.content_transfer.is_some());

    config.include_body = true;
    let with = timer.execute(&config).await;
    assert_eq!(with.body.as_deref(), Some("hello fleet"));
}

#[tokio::test]
async fn method_headers_and_body_are_sent_as_given() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-probe", "fleet"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(201).insert_header("x-reply", "yes"))
        .expect(1)
        .mount(&server)
        .await;

    let mut headers = BTreeMap::new();
    headers.insert("x-probe".to_string(), "fleet".to_string());
    let config = RequestConfig {
        id: json!("post-1"),
        url: Some(format!("{}/submit", server.uri())),
        method: Some("post".to_string()),
        headers,
        body: Some("payload".to_string()),
        ..Default::default()
    };

    let record = RequestTimer::new().execute(&config).await;
    assert_eq!(record.status_code, Some(201));
    assert_eq!(record.headers.get("x-reply").map(String::as_str), Some("yes"));
}

#[tokio::test]
async fn no_content_type_is_injected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let record = RequestTimer::new()
        .execute(&get(format!("{}/", server.uri())))
        .await;
    assert_eq!(record.status_code, Some(204));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0]
        .headers
        .keys()
        .any(|name| name.as_str().eq_ignore_ascii_case("content-type")));
}

#[tokio::test]
async fn url_parts_are_assembled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/parts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let addr = server.address();
    let config = RequestConfig {
        protocol: Some("http:".to_string()),
        hostname: Some(addr.ip().to_string()),
        port: Some(addr.port()),
        path: Some("parts".to_string()),
        ..Default::default()
    };
    let record = RequestTimer::new().execute(&config).await;
    assert_eq!(record.status_code, Some(200));
}

#[tokio::test]
async fn connection_refused_is_captured() {
    let record = RequestTimer::new()
        .execute(&get("http://127.0.0.1:1/".to_string()))
        .await;

    assert!(record.error.is_some());
    assert_eq!(record.error_category.as_deref(), Some("connect_error"));
    assert_eq!(record.status_code, None);
    assert!(record.timing_phases.dns_lookup.is_some());
    assert!(record.timing_phases.tcp_connection.is_none());
    assert!(record.timing_phases.first_byte.is_none());
}

#[tokio::test]
async fn unresolvable_host_is_captured() {
    let record = RequestTimer::new()
        .execute(&get("http://fleet-agent-test.invalid/".to_string()))
        .await;

    assert_eq!(record.error_category.as_deref(), Some("dns_error"));
    assert!(record.timing_phases.dns_lookup.is_none());
}

#[tokio::test]
async fn slow_response_hits_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mut config = get(format!("{}/", server.uri()));
    config.timeout = Some(200);
    let record = RequestTimer::new().execute(&config).await;

    assert_eq!(record.error_category.as_deref(), Some("timeout_error"));
    assert!(record.timing_phases.total >= 200.0);
    assert!(record.timing_phases.total < 2_000.0);
}

#[tokio::test]
async fn unsupported_scheme_is_invalid_request() {
    let record = RequestTimer::new()
        .execute(&get("ftp://example.com/file".to_string()))
        .await;
    assert_eq!(record.error_category.as_deref(), Some("invalid_request"));
    assert!(record.timing_phases.dns_lookup.is_none());
}

#[tokio::test]
async fn https_to_plain_server_is_tls_error() {
    let server = MockServer::start().await;
    let url = server.uri().replacen("http://", "https://", 1);

    let record = RequestTimer::new().execute(&get(format!("{}/", url))).await;

    assert_eq!(record.error_category.as_deref(), Some("tls_error"));
    assert!(record.error.is_some());
    assert_eq!(record.status_code, None);
    let phases = &record.timing_phases;
    assert!(phases.dns_lookup.is_some());
    assert!(phases.tcp_connection.is_some());
    assert!(phases.tls_handshake.is_none());
    assert!(phases.first_byte.is_none());
    assert!(phases.content_transfer.is_none());
}

/// Serve one fixed response over TLS with a fresh self-signed certificate for
/// 127.0.0.1. Returns the bound address and a client config trusting it.
async fn self_signed_server() -> (std::net::SocketAddr, Arc<ClientConfig>) {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(|_req: Request<Body>| async {
                    Ok::<_, Infallible>(Response::new(Body::from("secure")))
                });
                let _ = Http::new().serve_connection(tls, service).await;
            });
        }
    });

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let mut client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    (addr, Arc::new(client_config))
}

#[tokio::test]
async fn https_reports_handshake_and_first_byte_after_it() {
    let (addr, tls) = self_signed_server().await;
    let timer = RequestTimer::with_tls_config(tls);

    let mut config = get(format!("https://{}/secure", addr));
    config.include_body = true;
    let record = timer.execute(&config).await;

    assert_eq!(record.error, None, "{:?}", record.error_category);
    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.body.as_deref(), Some("secure"));

    let phases = &record.timing_phases;
    assert!(phases.tcp_connection.is_some());
    assert!(phases.tls_handshake.is_some());
    assert!(phases.first_byte.is_some());
    assert!(
        (phases.sum_of_phases() - phases.total).abs() < 0.5,
        "phases {} vs total {}",
        phases.sum_of_phases(),
        phases.total
    );

    let secure_connect = record.timings.secure_connect.unwrap();
    let response = record.timings.response.unwrap();
    assert!(record.timings.connect.unwrap() <= secure_connect);
    assert!(
        (response - secure_connect - phases.first_byte.unwrap()).abs() < 0.01,
        "first byte should be measured from the handshake"
    );
}

#[tokio::test]
async fn untrusted_certificate_is_tls_error() {
    let (addr, _) = self_signed_server().await;

    let record = RequestTimer::new()
        .execute(&get(format!("https://{}/secure", addr)))
        .await;

    assert_eq!(record.error_category.as_deref(), Some("tls_error"));
    assert!(record.timing_phases.tcp_connection.is_some());
    assert!(record.timing_phases.tls_handshake.is_none());
}
