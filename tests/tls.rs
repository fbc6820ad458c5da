use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tcpkit::net::tls::server_config_from_pem;
use tcpkit::{ConfigError, ErrorLog, Graceful, Server, ServerConfig, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/cert.pem");
const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/key.pem");

// The test certificate is self-signed.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn echo_round_trip(graceful: &Graceful, payload: &[u8]) -> Vec<u8> {
    let addr = graceful.local_addr().expect("server should be bound");
    let tcp = TcpStream::connect(addr).await.unwrap();
    let domain = ServerName::try_from("localhost").unwrap();
    let mut tls = connector().connect(domain, tcp).await.unwrap();

    tls.write_all(payload).await.unwrap();
    let mut got = vec![0u8; payload.len()];
    tls.read_exact(&mut got).await.unwrap();
    got
}

#[tokio::test]
async fn serves_tls_from_pem_files() {
    let graceful = Server::new(ServerConfig::with_addr("127.0.0.1:0")).start_tls(CERT, KEY);
    assert!(!graceful.is_done(), "{:?}", graceful.error());

    assert_eq!(echo_round_trip(&graceful, b"secure hello").await, b"secure hello");

    graceful.close();
    graceful.done().await.unwrap();
}

#[tokio::test]
async fn serves_tls_from_preset_config() {
    let preset = Arc::new(server_config_from_pem(CERT, KEY).unwrap());
    let graceful = Server::new(ServerConfig::with_addr("127.0.0.1:0"))
        .tls_config(preset)
        .start_tls("", "");

    assert_eq!(echo_round_trip(&graceful, b"preset").await, b"preset");

    graceful.close();
    graceful.done().await.unwrap();
}

#[tokio::test]
async fn missing_files_are_reported_as_config_errors() {
    let graceful =
        Server::new(ServerConfig::with_addr("127.0.0.1:0")).start_tls("/nonexistent/cert.pem", KEY);
    let err = graceful.done().await.unwrap_err();
    assert!(matches!(&*err, ServerError::Config(ConfigError::TlsFile { .. })));

    let graceful = Server::new(ServerConfig::with_addr("127.0.0.1:0")).start_tls(CERT, "");
    let err = graceful.done().await.unwrap_err();
    assert!(matches!(&*err, ServerError::Config(ConfigError::MissingTlsMaterial)));
}

#[tokio::test]
async fn failed_handshake_is_logged_and_server_keeps_running() {
    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&lines);
    let graceful = Server::new(ServerConfig::with_addr("127.0.0.1:0"))
        .error_log(ErrorLog::sink(move |line| sink.lock().unwrap().push(line.to_owned())))
        .start_tls(CERT, KEY);
    let addr = graceful.local_addr().unwrap();

    let mut plain = TcpStream::connect(addr).await.unwrap();
    plain.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut rest = Vec::new();
    let _ = plain.read_to_end(&mut rest).await;

    assert_eq!(echo_round_trip(&graceful, b"still up").await, b"still up");
    assert!(lines.lock().unwrap().iter().any(|l| l.contains("tls handshake")));

    graceful.close();
    graceful.done().await.unwrap();
}
