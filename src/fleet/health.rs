//! Out-of-band camera health probing.
//!
//! Every configured camera is probed on a fixed interval, running or not.
//! A probe never fails; problems are recorded in the result fields.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use url::Url;

/// Last probe outcome for one camera. Replaced wholesale by each check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub host_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_error: Option<String>,
    pub url_accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_error: Option<String>,
    pub response_time_ms: u64,
    /// RFC 3339 timestamp of the check.
    pub last_checked: String,
}

impl HealthCheckResult {
    fn stamped() -> Self {
        Self {
            last_checked: chrono::Local::now().to_rfc3339(),
            ..Self::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.host_reachable && self.url_accessible
    }
}

pub type HealthCache = Arc<RwLock<HashMap<String, HealthCheckResult>>>;

pub trait HealthProbe: Send + Sync {
    fn check(&self, url: &str) -> HealthCheckResult;
}

/// TCP connect to the camera host, then an HTTP GET of the stream URL.
#[derive(Clone, Debug)]
pub struct TcpHttpProbe {
    timeout: Duration,
    agent: ureq::Agent,
}

impl TcpHttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .build();
        Self { timeout, agent }
    }

    fn tcp_ping(&self, url: &Url) -> Result<(), String> {
        let host = url
            .host_str()
            .ok_or_else(|| "url has no host".to_string())?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| format!("TCP connection failed: {}", e))?
            .next()
            .ok_or_else(|| format!("TCP connection failed: {} did not resolve", host))?;
        TcpStream::connect_timeout(&addr, self.timeout)
            .map(drop)
            .map_err(|e| format!("TCP connection failed: {}", e))
    }

    fn http_get(&self, url: &str) -> Result<(), String> {
        match self.agent.get(url).call() {
            // The body is never read; MJPEG endpoints stream forever.
            Ok(response) if response.status() < 400 => Ok(()),
            Ok(response) => Err(format!("HTTP {}", response.status())),
            Err(ureq::Error::Status(code, _)) => Err(format!("HTTP {}", code)),
            Err(e) => Err(format!("HTTP request failed: {}", e)),
        }
    }
}

impl HealthProbe for TcpHttpProbe {
    fn check(&self, raw: &str) -> HealthCheckResult {
        let mut result = HealthCheckResult::stamped();
        if raw.starts_with("stub://") {
            result.host_reachable = true;
            result.url_accessible = true;
            return result;
        }

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                let msg = format!("Invalid URL: {}", e);
                result.host_error = Some(msg.clone());
                result.url_error = Some(msg);
                return result;
            }
        };

        if let Err(e) = self.tcp_ping(&url) {
            result.host_error = Some(e);
            result.url_error = Some("Host unreachable".to_string());
            return result;
        }
        result.host_reachable = true;

        let started = Instant::now();
        match self.http_get(raw) {
            Ok(()) => result.url_accessible = true,
            Err(e) => result.url_error = Some(e),
        }
        result.response_time_ms = started.elapsed().as_millis() as u64;
        result
    }
}

/// Probe every `(camera, url)` pair and replace its cache entry.
pub fn check_all(targets: &[(String, String)], probe: &dyn HealthProbe, cache: &HealthCache) {
    for (camera, url) in targets {
        let result = probe.check(url);
        log::debug!(
            "[{}] health: host_reachable={} url_accessible={} response_time_ms={}",
            camera,
            result.host_reachable,
            result.url_accessible,
            result.response_time_ms
        );
        cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(camera.clone(), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn stub_urls_are_always_healthy() {
        let probe = TcpHttpProbe::new(Duration::from_millis(200));
        let result = probe.check("stub://porch");
        assert!(result.is_healthy());
        assert!(!result.last_checked.is_empty());
    }

    #[test]
    fn invalid_url_reports_both_errors() {
        let probe = TcpHttpProbe::new(Duration::from_millis(200));
        let result = probe.check("not a url");
        assert!(!result.host_reachable);
        assert!(result.host_error.unwrap().starts_with("Invalid URL"));
        assert!(result.url_error.is_some());
    }

    #[test]
    fn closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpHttpProbe::new(Duration::from_millis(200));
        let result = probe.check(&format!("http://127.0.0.1:{}/video", port));
        assert!(!result.host_reachable);
        assert_eq!(result.url_error.as_deref(), Some("Host unreachable"));
    }

    #[test]
    fn http_status_is_checked() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            use std::io::{Read, Write};
            // First accept is the TCP ping, second the GET.
            for status in ["", "404 Not Found"] {
                let (mut stream, _) = listener.accept().unwrap();
                if status.is_empty() {
                    continue;
                }
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
            }
        });
        let probe = TcpHttpProbe::new(Duration::from_secs(2));
        let result = probe.check(&format!("http://{}/video", addr));
        server.join().unwrap();
        assert!(result.host_reachable);
        assert!(!result.url_accessible);
        assert_eq!(result.url_error.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn check_all_supersedes_cache_entries() {
        struct Fixed(bool);
        impl HealthProbe for Fixed {
            fn check(&self, _url: &str) -> HealthCheckResult {
                HealthCheckResult {
                    host_reachable: self.0,
                    ..HealthCheckResult::stamped()
                }
            }
        }

        let cache = HealthCache::default();
        let targets = vec![("yard".to_string(), "stub://yard".to_string())];
        check_all(&targets, &Fixed(true), &cache);
        check_all(&targets, &Fixed(false), &cache);
        let cache = cache.read().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(!cache["yard"].host_reachable);
    }
}
