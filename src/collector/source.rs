//! Where profile payloads come from.

use crate::error::CollectError;
use crate::types::Target;
use reqwest::blocking::Client;
use std::time::Duration;

/// Fetches the raw profile payload of one target.
pub trait ProfileSource: Send + Sync {
    fn fetch(&self, target: &Target) -> Result<Vec<u8>, CollectError>;
}

impl<F> ProfileSource for F
where
    F: Fn(&Target) -> Result<Vec<u8>, CollectError> + Send + Sync,
{
    fn fetch(&self, target: &Target) -> Result<Vec<u8>, CollectError> {
        self(target)
    }
}

/// Polls targets over HTTP, asking each to reset its counters after replying.
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// Create a source whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, CollectError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            // Targets are worker processes on the local network.
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

impl ProfileSource for HttpSource {
    fn fetch(&self, target: &Target) -> Result<Vec<u8>, CollectError> {
        let response = self.client.get(target.url()).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::Status(status.as_u16()));
        }

        Ok(response.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one request with `status` and `body`; hands back the request line.
    fn serve_once(status: &'static str, body: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                if header == "\r\n" || header.is_empty() {
                    break;
                }
            }

            write!(
                stream,
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            )
            .unwrap();
            request_line
        });

        (port, handle)
    }

    #[test]
    fn test_fetch_requests_reset() {
        let (port, server) = serve_once("200 OK", "h1\nh2\nabc 5\n");
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let body = source.fetch(&Target::new("127.0.0.1", port)).unwrap();
        assert_eq!(body, b"h1\nh2\nabc 5\n");

        let request_line = server.join().unwrap();
        assert!(request_line.starts_with("GET /?reset=true HTTP/1.1"));
    }

    #[test]
    fn test_error_status() {
        let (port, server) = serve_once("503 Service Unavailable", "busy");
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let result = source.fetch(&Target::new("127.0.0.1", port));
        assert!(matches!(result, Err(CollectError::Status(503))));
        server.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        // Bind and drop to find a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let source = HttpSource::new(Duration::from_secs(5)).unwrap();

        let result = source.fetch(&Target::new("127.0.0.1", port));
        assert!(matches!(result, Err(CollectError::Fetch(_))));
    }
}
