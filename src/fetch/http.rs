use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::SourcesConfig;
use crate::fetch::{normalize_text, SourceFetcher};
use crate::model::{FetchStatus, SourceDocument};

const DEFAULT_USER_AGENT: &str = "niche-market-analyzer/0.1";

/// Fetches one page per configured URL template (`{query}` is URL-encoded in).
/// Requests run concurrently, at most `max_concurrent` in flight across all
/// queries; each has its own timeout, started once it holds a permit.
pub struct HttpFetcher {
    client: reqwest::Client,
    templates: Vec<String>,
    request_timeout: Duration,
    max_document_chars: usize,
    permits: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(
        sources: &SourcesConfig,
        request_timeout: Duration,
        max_document_chars: usize,
        max_concurrent: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(
                sources
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            )
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .context("building fetcher http client")?;
        let templates = sources
            .url_templates
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(Self {
            client,
            templates,
            request_timeout,
            max_document_chars,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    async fn fetch_one(
        client: reqwest::Client,
        permits: Arc<Semaphore>,
        url: String,
        timeout: Duration,
        max_chars: usize,
    ) -> SourceDocument {
        let Ok(_permit) = permits.acquire_owned().await else {
            return SourceDocument::failed(&url, FetchStatus::Error, "fetcher shut down");
        };
        let t0 = Instant::now();
        let res = tokio::time::timeout(timeout, async {
            let resp = client.get(&url).send().await?.error_for_status()?;
            resp.text().await
        })
        .await;
        histogram!("fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        match res {
            Err(_) => SourceDocument::failed(&url, FetchStatus::Timeout, "fetch timed out"),
            Ok(Err(e)) if e.is_timeout() => {
                SourceDocument::failed(&url, FetchStatus::Timeout, e.to_string())
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "collect", error = %e, url = %url, "source http error");
                SourceDocument::failed(&url, FetchStatus::Error, e.to_string())
            }
            Ok(Ok(body)) => SourceDocument::ok(&url, normalize_text(&body, max_chars)),
        }
    }
}

pub(crate) fn fill_template(template: &str, query: &str) -> String {
    template.replace("{query}", &urlencoding::encode(query))
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, query: &str, max_sources: usize) -> Vec<SourceDocument> {
        let mut set = JoinSet::new();
        for (idx, template) in self.templates.iter().take(max_sources).enumerate() {
            let url = fill_template(template, query);
            let client = self.client.clone();
            let permits = self.permits.clone();
            let timeout = self.request_timeout;
            let max_chars = self.max_document_chars;
            set.spawn(async move {
                (idx, Self::fetch_one(client, permits, url, timeout, max_chars).await)
            });
        }

        let mut docs: Vec<(usize, SourceDocument)> = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => docs.push(pair),
                Err(e) => tracing::warn!(target: "collect", error = %e, "fetch task aborted"),
            }
        }
        docs.sort_by_key(|(idx, _)| *idx);

        let out: Vec<SourceDocument> = docs
            .into_iter()
            .map(|(_, d)| d.for_query(query))
            .collect();
        for d in &out {
            let status = match d.status {
                FetchStatus::Ok => "ok",
                FetchStatus::Timeout => "timeout",
                FetchStatus::Error => "error",
            };
            counter!("fetch_documents_total", "status" => status).increment(1);
        }
        out
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP server that holds each request for `delay` and records the
    /// highest number of requests it saw at once.
    async fn slow_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let peak_out = peak.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let body = "market page";
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        (format!("http://{addr}"), peak_out)
    }

    #[tokio::test]
    async fn outbound_requests_share_one_bound_across_queries() {
        let (base, peak) = slow_server(Duration::from_millis(100)).await;
        let cfg = SourcesConfig {
            url_templates: vec![
                format!("{base}/a?q={{query}}"),
                format!("{base}/b?q={{query}}"),
                format!("{base}/c?q={{query}}"),
            ],
            user_agent: None,
        };
        let f = HttpFetcher::new(&cfg, Duration::from_secs(5), 1_000, 1).unwrap();
        let (a, b) = tokio::join!(f.fetch("yoga mats", 3), f.fetch("standing desks", 3));

        assert_eq!(a.len() + b.len(), 6);
        assert!(a.iter().chain(&b).all(|d| d.status == FetchStatus::Ok));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wider_bound_lets_requests_overlap() {
        let (base, peak) = slow_server(Duration::from_millis(150)).await;
        let cfg = SourcesConfig {
            url_templates: vec![format!("{base}/a?q={{query}}"), format!("{base}/b?q={{query}}")],
            user_agent: None,
        };
        let f = HttpFetcher::new(&cfg, Duration::from_secs(5), 1_000, 4).unwrap();
        let docs = f.fetch("yoga mats", 2).await;
        assert!(docs.iter().all(|d| d.status == FetchStatus::Ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn template_encodes_query() {
        assert_eq!(
            fill_template("https://search.test/?q={query}&n=10", "yoga mats & blocks"),
            "https://search.test/?q=yoga%20mats%20%26%20blocks&n=10"
        );
    }

    #[tokio::test]
    async fn unreachable_sources_yield_per_document_errors() {
        let cfg = SourcesConfig {
            url_templates: vec![
                "http://127.0.0.1:9/a?q={query}".into(),
                "http://127.0.0.1:9/b?q={query}".into(),
                "   ".into(),
            ],
            user_agent: None,
        };
        let f = HttpFetcher::new(&cfg, Duration::from_secs(2), 1_000, 4).unwrap();
        assert_eq!(f.templates().len(), 2);
        let docs = f.fetch("anything", 5).await;
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.status != FetchStatus::Ok));
        assert!(docs.iter().all(|d| d.query == "anything"));
        assert!(docs[0].url.contains("/a?"));
    }
}
