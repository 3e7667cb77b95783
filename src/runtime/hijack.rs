//! Raw exec-start over the engine socket.
//!
//! The engine answers `POST /exec/{id}/start` with an HTTP upgrade and then
//! uses the connection as a bare duplex stream: stdin goes up unframed, stdout
//! and stderr come back multiplexed. bollard demultiplexes that stream
//! internally, so the upgrade is requested here with hyper and the upgraded
//! connection is handed to the caller untouched.

use super::{ExecChannel, Result, RuntimeError};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Upper bound on an error body read back from the engine.
const MAX_ERROR_BODY: usize = 16 * 1024;

/// Where the engine API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Default engine socket.
    pub const DEFAULT_SOCKET: &'static str = "/var/run/docker.sock";

    /// Parse `unix://path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("unix://") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = url
            .strip_prefix("tcp://")
            .or_else(|| url.strip_prefix("http://"))
        {
            return Ok(Endpoint::Tcp(addr.trim_end_matches('/').to_string()));
        }
        Err(RuntimeError::Unavailable(format!(
            "Unsupported engine url: {}",
            url
        )))
    }

    fn uri(&self, path: &str) -> Result<Uri> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(socket) => Ok(hyperlocal::Uri::new(socket, path).into()),
            #[cfg(not(unix))]
            Endpoint::Unix(socket) => Err(RuntimeError::Unavailable(format!(
                "Unix sockets are not supported on this platform: {}",
                socket.display()
            ))),
            Endpoint::Tcp(addr) => format!("http://{}{}", addr, path).parse().map_err(|e| {
                RuntimeError::Protocol(format!("Bad request uri for {}: {}", path, e))
            }),
        }
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let response = match self {
            #[cfg(unix)]
            Endpoint::Unix(_) => {
                use hyperlocal::{UnixClientExt, UnixConnector};
                let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
                client.request(request).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => return Err(RuntimeError::Unavailable(self.to_string())),
            Endpoint::Tcp(_) => {
                let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
                client.request(request).await
            }
        };
        response.map_err(|e| RuntimeError::Unavailable(format!("{}: {}", self, e)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// Send `POST path` with `body`, request an upgrade, and return the raw
/// connection once the engine switches protocols.
pub(super) async fn upgrade(endpoint: &Endpoint, path: &str, body: &[u8]) -> Result<ExecChannel> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(endpoint.uri(path)?)
        .header(CONTENT_TYPE, "application/json")
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "tcp")
        .body(Full::new(Bytes::copy_from_slice(body)))
        .map_err(|e| RuntimeError::Protocol(format!("Bad exec start request: {}", e)))?;

    let response = endpoint.send(request).await?;
    let status = response.status();
    debug!("Exec start {} answered {}", path, status);

    if status == StatusCode::SWITCHING_PROTOCOLS {
        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| RuntimeError::Protocol(format!("Upgrade of {} failed: {}", path, e)))?;
        return Ok(Box::new(TokioIo::new(upgraded)));
    }

    let message = error_message(response).await;
    match status {
        StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(format!("{}: {}", path, message))),
        StatusCode::CONFLICT => Err(RuntimeError::Unavailable(format!(
            "Container for {} is not running: {}",
            path, message
        ))),
        other => Err(RuntimeError::Protocol(format!(
            "Unexpected status {} from {}: {}",
            other, path, message
        ))),
    }
}

/// The engine's `{"message": ...}` text, or the raw body.
async fn error_message(response: Response<Incoming>) -> String {
    let body = match Limited::new(response.into_body(), MAX_ERROR_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return e.to_string(),
    };
    serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.2:2375").unwrap(),
            Endpoint::Tcp("10.0.0.2:2375".to_string())
        );
        assert!(Endpoint::parse("ssh://host").is_err());
    }

    #[test]
    fn test_tcp_uri() {
        let endpoint = Endpoint::Tcp("10.0.0.2:2375".to_string());
        let uri = endpoint.uri("/v1.41/exec/abc/start").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.2:2375/v1.41/exec/abc/start");
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{UnixListener, UnixStream};

        /// Read one request head plus its body and return the head.
        async fn read_request(stream: &mut UnixStream) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending a request");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_string();
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    while buf.len() < end + 4 + length {
                        let n = stream.read(&mut chunk).await.unwrap();
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    return head;
                }
            }
        }

        fn socket(dir: &tempfile::TempDir) -> (UnixListener, Endpoint) {
            let path = dir.path().join("engine.sock");
            let listener = UnixListener::bind(&path).unwrap();
            (listener, Endpoint::Unix(path))
        }

        #[tokio::test]
        async fn test_upgrade_hands_back_raw_connection() {
            let dir = tempfile::TempDir::new().unwrap();
            let (listener, endpoint) = socket(&dir);

            let server = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let head = read_request(&mut stream).await;
                stream
                    .write_all(
                        b"HTTP/1.1 101 UPGRADED\r\n\
                          Content-Type: application/vnd.docker.raw-stream\r\n\
                          Connection: Upgrade\r\n\
                          Upgrade: tcp\r\n\r\n",
                    )
                    .await
                    .unwrap();

                let mut line = [0u8; 3];
                stream.read_exact(&mut line).await.unwrap();
                stream.write_all(&line).await.unwrap();
                head
            });

            let mut channel = upgrade(&endpoint, "/v1.41/exec/abc/start", b"{}")
                .await
                .unwrap();
            channel.write_all(b"hi\n").await.unwrap();
            let mut echoed = [0u8; 3];
            channel.read_exact(&mut echoed).await.unwrap();
            assert_eq!(&echoed, b"hi\n");

            let head = server.await.unwrap().to_ascii_lowercase();
            assert!(head.starts_with("post /v1.41/exec/abc/start http/1.1"));
            assert!(head.contains("upgrade: tcp"));
        }

        #[tokio::test]
        async fn test_plain_ok_is_not_an_upgrade() {
            let dir = tempfile::TempDir::new().unwrap();
            let (listener, endpoint) = socket(&dir);

            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                read_request(&mut stream).await;
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                    .await
                    .unwrap();
            });

            let err = upgrade(&endpoint, "/v1.41/exec/abc/start", b"{}")
                .await
                .err()
                .unwrap();
            assert!(matches!(err, RuntimeError::Protocol(_)));
        }

        #[tokio::test]
        async fn test_missing_exec_is_not_found() {
            let dir = tempfile::TempDir::new().unwrap();
            let (listener, endpoint) = socket(&dir);

            tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                read_request(&mut stream).await;
                let body = br#"{"message":"No such exec instance: abc"}"#;
                let head = format!(
                    "HTTP/1.1 404 Not Found\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).await.unwrap();
                stream.write_all(body).await.unwrap();
            });

            let err = upgrade(&endpoint, "/v1.41/exec/abc/start", b"{}")
                .await
                .err()
                .unwrap();
            match err {
                RuntimeError::NotFound(message) => {
                    assert!(message.contains("No such exec instance"))
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
