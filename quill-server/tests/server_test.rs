//! End-to-end gRPC tests over mutual TLS.
//!
//! Certificates are minted per test run: one CA, a server certificate for
//! `localhost`, and two client certificates whose common names are the
//! subjects the authorizer sees ("root" may do everything, "nobody" may do
//! nothing).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use quill_proto::{ConsumeRequest, GetServersRequest, LogClient, ProduceRequest, Record};
use quill_server::{grpc_server, Authorizer, LogService};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity, Server, ServerTlsConfig};
use tonic::Code;
use tonic_types::StatusExt;

struct TestCa {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

struct TestCert {
    cert_pem: String,
    key_pem: String,
}

fn new_ca() -> TestCa {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "quill test ca");
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

fn issue(ca: &TestCa, common_name: &str) -> TestCert {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    TestCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

/// Stub for the external policy engine: a set of allowed (subject, action)
/// pairs over the wildcard object.
struct TestAuthorizer {
    allowed: HashSet<(String, String)>,
}

impl TestAuthorizer {
    fn root_only() -> Self {
        let mut allowed = HashSet::new();
        for action in ["produce", "consume"] {
            allowed.insert(("root".to_string(), action.to_string()));
        }
        Self { allowed }
    }
}

impl Authorizer for TestAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> bool {
        object == "*"
            && self
                .allowed
                .contains(&(subject.to_string(), action.to_string()))
    }
}

struct Harness {
    root: LogClient<Channel>,
    nobody: LogClient<Channel>,
    _dir: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn setup() -> Harness {
    let ca = new_ca();
    let server_cert = issue(&ca, "server");
    let root_cert = issue(&ca, "root");
    let nobody_cert = issue(&ca, "nobody");

    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(quill_log::Log::open(dir.path(), quill_log::Config::default()).unwrap());
    let service = LogService::new(log, Arc::new(TestAuthorizer::root_only()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(
            &server_cert.cert_pem,
            &server_cert.key_pem,
        ))
        .client_ca_root(Certificate::from_pem(ca.cert.pem()));

    let server = tokio::spawn(async move {
        Server::builder()
            .tls_config(tls)
            .unwrap()
            .add_service(grpc_server(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let client = |cert: &TestCert| {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca.cert.pem()))
            .identity(Identity::from_pem(&cert.cert_pem, &cert.key_pem))
            .domain_name("localhost");
        Channel::from_shared(format!("https://localhost:{port}"))
            .unwrap()
            .tls_config(tls)
            .unwrap()
    };

    let root_endpoint = client(&root_cert);
    let nobody_endpoint = client(&nobody_cert);

    // The server accepts lazily; retry until the handshake goes through.
    let connect = |endpoint: tonic::transport::Endpoint| async move {
        for _ in 0..50 {
            if let Ok(channel) = endpoint.connect().await {
                return LogClient::new(channel);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not come up");
    };

    Harness {
        root: connect(root_endpoint).await,
        nobody: connect(nobody_endpoint).await,
        _dir: dir,
        server,
    }
}

fn produce_request(value: &str) -> ProduceRequest {
    ProduceRequest {
        record: Some(Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_produce_consume() {
    let mut harness = setup().await;

    let produced = harness
        .root
        .produce(produce_request("hello world"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(produced.offset, 0);

    let consumed = harness
        .root
        .consume(ConsumeRequest {
            offset: produced.offset,
        })
        .await
        .unwrap()
        .into_inner();

    let record = consumed.record.unwrap();
    assert_eq!(record.value, b"hello world");
    assert_eq!(record.offset, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consume_past_boundary() {
    let mut harness = setup().await;

    harness
        .root
        .produce(produce_request("hello world"))
        .await
        .unwrap();

    let status = harness
        .root
        .consume(ConsumeRequest { offset: 1 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let localized = status
        .get_details_localized_message()
        .expect("status should carry a localized detail");
    assert_eq!(localized.locale, "en-US");
    assert_eq!(
        localized.message,
        "The requested offset is outside the log's range: 1"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_produce_consume_stream() {
    let mut harness = setup().await;

    let requests = tokio_stream::iter(vec![
        produce_request("first"),
        produce_request("second"),
    ]);
    let mut responses = harness
        .root
        .produce_stream(requests)
        .await
        .unwrap()
        .into_inner();

    for want in 0..2u64 {
        let response = responses.message().await.unwrap().unwrap();
        assert_eq!(response.offset, want);
    }

    let mut stream = harness
        .root
        .consume_stream(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();

    for (offset, value) in [(0u64, "first"), (1, "second")] {
        let record = stream.message().await.unwrap().unwrap().record.unwrap();
        assert_eq!(record.offset, offset);
        assert_eq!(record.value, value.as_bytes());
    }

    // The stream keeps tailing: a record produced after the reads arrives
    // without reopening it.
    harness
        .root
        .produce(produce_request("third"))
        .await
        .unwrap();
    let record = stream.message().await.unwrap().unwrap().record.unwrap();
    assert_eq!(record.offset, 2);
    assert_eq!(record.value, b"third");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unauthorized() {
    let mut harness = setup().await;

    let status = harness
        .nobody
        .produce(produce_request("denied"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = harness
        .nobody
        .consume(ConsumeRequest { offset: 0 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_servers_empty_without_cluster() {
    let mut harness = setup().await;

    let response = harness
        .root
        .get_servers(GetServersRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(response.servers.is_empty());
}
