//! HTTP management API client.
//!
//! The server under test exposes a small management surface:
//! `PUT /name/<container>/<ip>?fqdn=<name>` publishes a name,
//! `DELETE` on the same URL removes it, and `GET /status` reports
//! liveness. This client wraps those three calls and a readiness poll.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("management request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("management request to {url} rejected with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("server at {server} not ready within {deadline:?}")]
    NotReady {
        server: SocketAddr,
        deadline: Duration,
    },
}

/// Client for one server instance's management API.
pub struct AdminClient {
    base: String,
    server: SocketAddr,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            base: format!("http://{server}"),
            server,
            http: reqwest::Client::new(),
        }
    }

    /// Publish `fqdn -> ip` for a container at this instance.
    pub async fn publish(
        &self,
        container: &str,
        ip: Ipv4Addr,
        fqdn: &str,
    ) -> Result<(), AdminError> {
        let url = self.name_url(container, ip);
        info!(server = %self.server, %fqdn, %ip, "publishing name");
        let response = self
            .http
            .put(&url)
            .query(&[("fqdn", fqdn)])
            .send()
            .await
            .map_err(|source| AdminError::Request {
                url: url.clone(),
                source,
            })?;
        check_status(url, &response)
    }

    /// Remove a previously published name at this instance.
    pub async fn delete(
        &self,
        container: &str,
        ip: Ipv4Addr,
        fqdn: &str,
    ) -> Result<(), AdminError> {
        let url = self.name_url(container, ip);
        info!(server = %self.server, %fqdn, %ip, "deleting name");
        let response = self
            .http
            .delete(&url)
            .query(&[("fqdn", fqdn)])
            .send()
            .await
            .map_err(|source| AdminError::Request {
                url: url.clone(),
                source,
            })?;
        check_status(url, &response)
    }

    /// Poll `/status` until the instance answers, replacing the fixed
    /// post-launch sleeps of the original harness.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), AdminError> {
        let url = format!("{}/status", self.base);
        let start = Instant::now();
        loop {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(server = %self.server, elapsed = ?start.elapsed(), "server ready");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(server = %self.server, status = %response.status(), "not ready yet")
                }
                Err(err) => debug!(server = %self.server, %err, "not reachable yet"),
            }
            if start.elapsed() >= deadline {
                return Err(AdminError::NotReady {
                    server: self.server,
                    deadline,
                });
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    fn name_url(&self, container: &str, ip: Ipv4Addr) -> String {
        format!("{}/name/{container}/{ip}", self.base)
    }
}

fn check_status(url: String, response: &reqwest::Response) -> Result<(), AdminError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(AdminError::Status {
            url,
            status: response.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        calls: Arc<Mutex<Vec<(String, String, String, String)>>>,
    }

    fn record(
        seen: &Seen,
        method: &str,
        container: String,
        ip: String,
        params: &HashMap<String, String>,
    ) -> StatusCode {
        let fqdn = params.get("fqdn").cloned().unwrap_or_default();
        seen.calls
            .lock()
            .unwrap()
            .push((method.to_string(), container, ip, fqdn));
        StatusCode::OK
    }

    async fn put_name(
        State(seen): State<Seen>,
        Path((container, ip)): Path<(String, String)>,
        Query(params): Query<HashMap<String, String>>,
    ) -> StatusCode {
        record(&seen, "PUT", container, ip, &params)
    }

    async fn delete_name(
        State(seen): State<Seen>,
        Path((container, ip)): Path<(String, String)>,
        Query(params): Query<HashMap<String, String>>,
    ) -> StatusCode {
        record(&seen, "DELETE", container, ip, &params)
    }

    async fn spawn_admin_stub() -> (SocketAddr, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route("/name/{container}/{ip}", put(put_name).delete(delete_name))
            .route("/status", get(|| async { "OK" }))
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, seen)
    }

    #[tokio::test]
    async fn publish_hits_put_with_fqdn_param() {
        let (addr, seen) = spawn_admin_stub().await;
        let client = AdminClient::new(addr);

        client
            .publish("c1", Ipv4Addr::new(10, 9, 9, 9), "test1.weave.local.")
            .await
            .unwrap();

        let calls = seen.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "PUT".to_string(),
                "c1".to_string(),
                "10.9.9.9".to_string(),
                "test1.weave.local.".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn delete_hits_delete_route() {
        let (addr, seen) = spawn_admin_stub().await;
        let client = AdminClient::new(addr);

        client
            .delete("c1", Ipv4Addr::new(10, 9, 9, 9), "test1.weave.local.")
            .await
            .unwrap();

        let calls = seen.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "DELETE");
    }

    #[tokio::test]
    async fn wait_ready_succeeds_against_status_route() {
        let (addr, _seen) = spawn_admin_stub().await;
        let client = AdminClient::new(addr);
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_server() {
        // Reserved but unserved port: bind then drop the listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = AdminClient::new(addr);
        let err = client.wait_ready(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, AdminError::NotReady { .. }));
    }
}
