use async_trait::async_trait;
use http::{header::CONTENT_TYPE, HeaderValue};
use synthmesh_core::{
    error::{ErrorContext as _, GenericError},
    DownstreamCaller, DownstreamError, DownstreamRequest, DownstreamResponse,
};
use tracing::debug;

/// Calls downstream nodes over HTTP.
pub struct HttpCaller {
    client: reqwest::Client,
    default_port: u16,
}

impl HttpCaller {
    /// Creates a new `HttpCaller`.
    ///
    /// Targets given without a port are called on `default_port`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(default_port: u16) -> Result<Self, GenericError> {
        let client = reqwest::Client::builder()
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self { client, default_port })
    }
}

#[async_trait]
impl DownstreamCaller for HttpCaller {
    async fn call(&self, request: DownstreamRequest) -> Result<DownstreamResponse, DownstreamError> {
        let url = target_url(&request.target, self.default_port, &request.route_key);
        debug!(%url, bytes = request.payload.len(), "Calling downstream node.");

        let mut headers = request.headers;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let transport_error = |e: reqwest::Error| DownstreamError::Transport {
            target: request.target.clone(),
            source: Box::new(e),
        };

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .body(request.payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(DownstreamResponse { status, body })
    }
}

/// Builds the URL a downstream target is called at for the given route key.
///
/// A bare host is called on `default_port`, a `host:port` pair as given, and a full `http://` base URL as-is.
pub fn target_url(target: &str, default_port: u16, route_key: &str) -> String {
    let base = if target.starts_with("http://") {
        target.trim_end_matches('/').to_string()
    } else if has_port(target) {
        format!("http://{}", target)
    } else {
        format!("http://{}:{}", target, default_port)
    };

    format!("{}/{}", base, route_key)
}

fn has_port(target: &str) -> bool {
    // Bracketed IPv6 literals carry their own colons.
    let host_end = target.rfind(']').map_or(0, |idx| idx + 1);
    target[host_end..]
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hosts_use_the_default_port() {
        assert_eq!(target_url("svc-2", 8080, "r1"), "http://svc-2:8080/r1");
        assert_eq!(target_url("[::1]", 8080, "all"), "http://[::1]:8080/all");
    }

    #[test]
    fn explicit_ports_are_kept() {
        assert_eq!(target_url("svc-2:9000", 8080, "r1"), "http://svc-2:9000/r1");
        assert_eq!(target_url("127.0.0.1:9000", 8080, "random"), "http://127.0.0.1:9000/random");
        assert_eq!(target_url("[::1]:9000", 8080, "r1"), "http://[::1]:9000/r1");
    }

    #[test]
    fn urls_are_used_as_is() {
        assert_eq!(target_url("http://svc-2:9000/", 8080, "r1"), "http://svc-2:9000/r1");
        assert_eq!(
            target_url("http://mesh.example.com/prefix", 8080, "r1"),
            "http://mesh.example.com/prefix/r1"
        );
    }
}
