//! Namespace-to-backend routing with readiness probing and bounded
//! download retries.
//!
//! Bindings are consulted in registration order and the first regex
//! match wins, so more specific patterns must be registered before
//! catch-alls.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::bandwidth::{BandwidthConfig, BandwidthLimitedClient};
use crate::client::BackendClient;
use crate::error::{BackendError, BackendResult};

/// Number of download attempts before surfacing the last error.
const DOWNLOAD_ATTEMPTS: usize = 3;
/// Pause between download attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Per-binding registration knobs.
#[derive(Debug, Clone)]
pub struct BindingOptions {
    /// Required backends must hold their readiness probe blob; optional
    /// backends only need to be reachable.
    pub required: bool,
    /// Namespace used for the readiness probe.
    pub probe_namespace: String,
    /// Blob name used for the readiness probe.
    pub probe_name: String,
    /// Optional bandwidth limits decorating the client.
    pub bandwidth: Option<BandwidthConfig>,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            required: true,
            probe_namespace: "readiness".to_string(),
            probe_name: "_ready".to_string(),
            bandwidth: None,
        }
    }
}

struct Binding {
    pattern: Regex,
    client: Arc<dyn BackendClient>,
    options: BindingOptions,
}

/// Ordered routing table from namespace patterns to backend clients.
#[derive(Default)]
pub struct BackendManager {
    bindings: Vec<Binding>,
}

impl BackendManager {
    /// An empty routing table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding; `pattern` is a namespace regex.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when the pattern does not
    /// compile or the bandwidth limits are invalid.
    pub fn register(
        &mut self,
        pattern: &str,
        client: Arc<dyn BackendClient>,
        options: BindingOptions,
    ) -> BackendResult<()> {
        let pattern = Regex::new(pattern).map_err(|_| BackendError::Config {
            field: "pattern",
            reason: "invalid namespace regex",
        })?;
        let client: Arc<dyn BackendClient> = match options.bandwidth {
            Some(limits) => Arc::new(BandwidthLimitedClient::new(client, limits)?),
            None => client,
        };
        debug!(pattern = %pattern, required = options.required, "registered backend binding");
        self.bindings.push(Binding {
            pattern,
            client,
            options,
        });
        Ok(())
    }

    /// Resolve the first binding whose pattern matches `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NamespaceNotFound`] when nothing matches.
    pub fn get_client(&self, namespace: &str) -> BackendResult<Arc<dyn BackendClient>> {
        self.bindings
            .iter()
            .find(|binding| binding.pattern.is_match(namespace))
            .map(|binding| Arc::clone(&binding.client))
            .ok_or_else(|| BackendError::NamespaceNotFound {
                namespace: namespace.to_string(),
            })
    }

    /// Probe every binding: required backends must hold their probe
    /// blob, optional backends may answer blob-not-found (reachable).
    pub async fn is_ready(&self) -> bool {
        for binding in &self.bindings {
            let probe = binding
                .client
                .stat(&binding.options.probe_namespace, &binding.options.probe_name)
                .await;
            match probe {
                Ok(_) => {}
                Err(err) if err.is_not_found() && !binding.options.required => {}
                Err(err) => {
                    warn!(
                        pattern = %binding.pattern,
                        error = %err,
                        "backend readiness probe failed"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Download with a small bounded retry loop; absence is definitive
    /// and not retried.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error.
    pub async fn download(
        &self,
        namespace: &str,
        name: &str,
        sink: &mut (dyn std::io::Write + Send),
    ) -> BackendResult<u64> {
        let client = self.get_client(namespace)?;
        let mut last = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match client.download(namespace, name, sink).await {
                Ok(written) => return Ok(written),
                Err(err) if err.is_not_found() => return Err(err),
                Err(err) => {
                    warn!(
                        namespace = %namespace,
                        name = %name,
                        attempt,
                        error = %err,
                        "backend download attempt failed"
                    );
                    last = Some(err);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BlobInfo, ListOptions, ListResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        label: &'static str,
        stat_result: fn() -> BackendResult<BlobInfo>,
        failures_before_success: AtomicUsize,
    }

    impl ScriptedClient {
        fn ok(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                stat_result: || Ok(BlobInfo { size: 1 }),
                failures_before_success: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendClient for ScriptedClient {
        async fn stat(&self, _namespace: &str, _name: &str) -> BackendResult<BlobInfo> {
            (self.stat_result)()
        }

        async fn upload(
            &self,
            _namespace: &str,
            _name: &str,
            _source: &mut (dyn std::io::Read + Send),
        ) -> BackendResult<()> {
            Ok(())
        }

        async fn download(
            &self,
            _namespace: &str,
            _name: &str,
            sink: &mut (dyn std::io::Write + Send),
        ) -> BackendResult<u64> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(BackendError::InvalidResponse {
                    operation: "download",
                    reason: "scripted failure",
                    status: Some(500),
                });
            }
            sink.write_all(self.label.as_bytes())
                .map_err(|e| BackendError::io("download.write", e))?;
            Ok(self.label.len() as u64)
        }

        async fn list(&self, _prefix: &str, _options: ListOptions) -> BackendResult<ListResult> {
            Ok(ListResult::default())
        }
    }

    #[tokio::test]
    async fn first_match_wins() -> anyhow::Result<()> {
        let mut manager = BackendManager::new();
        manager.register(
            "^library/.*$",
            ScriptedClient::ok("specific"),
            BindingOptions::default(),
        )?;
        manager.register(".*", ScriptedClient::ok("catchall"), BindingOptions::default())?;

        let mut sink = Vec::new();
        manager.download("library/redis", "blob", &mut sink).await?;
        assert_eq!(sink, b"specific");

        let mut sink = Vec::new();
        manager.download("other/thing", "blob", &mut sink).await?;
        assert_eq!(sink, b"catchall");

        assert!(matches!(
            BackendManager::new().get_client("anything"),
            Err(BackendError::NamespaceNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn downloads_retry_transient_failures() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient {
            label: "recovered",
            stat_result: || Ok(BlobInfo { size: 1 }),
            failures_before_success: AtomicUsize::new(2),
        });
        let mut manager = BackendManager::new();
        manager.register(".*", client, BindingOptions::default())?;

        let mut sink = Vec::new();
        manager.download("ns", "blob", &mut sink).await?;
        assert_eq!(sink, b"recovered");
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient {
            label: "unused",
            stat_result: || Ok(BlobInfo { size: 1 }),
            failures_before_success: AtomicUsize::new(usize::MAX),
        });
        let mut manager = BackendManager::new();
        manager.register(".*", client, BindingOptions::default())?;
        let mut sink = Vec::new();
        let err = manager.download("ns", "gone", &mut sink).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn readiness_distinguishes_required_and_optional() -> anyhow::Result<()> {
        let missing_probe: Arc<dyn BackendClient> = Arc::new(ScriptedClient {
            label: "probe",
            stat_result: || {
                Err(BackendError::BlobNotFound {
                    name: "_ready".to_string(),
                })
            },
            failures_before_success: AtomicUsize::new(0),
        });

        let mut optional = BackendManager::new();
        optional.register(
            ".*",
            Arc::clone(&missing_probe),
            BindingOptions {
                required: false,
                ..BindingOptions::default()
            },
        )?;
        assert!(optional.is_ready().await);

        let mut required = BackendManager::new();
        required.register(".*", missing_probe, BindingOptions::default())?;
        assert!(!required.is_ready().await);

        let mut healthy = BackendManager::new();
        healthy.register(".*", ScriptedClient::ok("x"), BindingOptions::default())?;
        assert!(healthy.is_ready().await);
        Ok(())
    }
}
