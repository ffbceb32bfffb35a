//! Periodic liveness checks against the remote peer.
use crate::config::PingConfig;
use crate::runtime::Peer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Pings the peer on a fixed interval and calls back after too many consecutive failures.
///
/// The failure count starts over after each callback, so a peer that stays dead triggers the
/// callback every `max_failures` intervals.  Stops when dropped.
#[derive(Debug)]
pub struct PingScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PingScheduler {
    pub fn start<F>(peer: Peer, config: PingConfig, on_failure: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let max_failures = config.max_failures.max(1);

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut failures = 0u32;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.interval()) => {}
                    }

                    let ping = peer.request_with_timeout("ping", None, config.timeout());
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = ping => result,
                    };

                    match result {
                        Ok(_) => {
                            if failures > 0 {
                                debug!(failures, "Peer answered ping again");
                            }
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, failures, "Ping failed");
                            if failures >= max_failures {
                                on_failure(failures);
                                failures = 0;
                            }
                        }
                    }
                }
                trace!("Ping scheduler stopped");
            }
        });

        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PingScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::RequestHandler;
    use crate::test_helpers::init_test_logging;
    use mcplink_jsonrpc::transport::duplex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoHandler;
    impl RequestHandler for NoHandler {}

    fn config() -> PingConfig {
        PingConfig {
            interval_ms: 50,
            timeout_ms: 50,
            max_failures: 2,
        }
    }

    #[tokio::test]
    async fn live_peer_never_fails() -> anyhow::Result<()> {
        init_test_logging();
        let (a, b) = duplex(4096);
        let runtime = RuntimeConfig::default();
        let (pinger, responder) = (Peer::new(Arc::new(a), &runtime), Peer::new(Arc::new(b), &runtime));
        for peer in [pinger.clone(), responder.clone()] {
            tokio::spawn(async move { peer.serve(Arc::new(Pong)).await });
        }

        let failures = Arc::new(AtomicU32::new(0));
        let scheduler = PingScheduler::start(pinger, config(), {
            let failures = failures.clone();
            move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.is_finished());
        Ok(())
    }

    #[tokio::test]
    async fn silent_peer_triggers_callback() -> anyhow::Result<()> {
        init_test_logging();
        // The other end is never served, so pings go unanswered
        let (a, _b) = duplex(4096);
        let pinger = Peer::new(Arc::new(a), &RuntimeConfig::default());
        tokio::spawn({
            let pinger = pinger.clone();
            async move { pinger.serve(Arc::new(NoHandler)).await }
        });

        let (sender, mut callbacks) = tokio::sync::mpsc::unbounded_channel();
        let _scheduler = PingScheduler::start(pinger, config(), move |failures| {
            let _ = sender.send(failures);
        });

        let failures = tokio::time::timeout(Duration::from_secs(2), callbacks.recv()).await?;
        assert_eq!(failures, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn stopping_mid_ping_releases_the_request() -> anyhow::Result<()> {
        init_test_logging();
        let (a, _b) = duplex(4096);
        let pinger = Peer::new(Arc::new(a), &RuntimeConfig::default());
        tokio::spawn({
            let pinger = pinger.clone();
            async move { pinger.serve(Arc::new(NoHandler)).await }
        });

        let config = PingConfig {
            interval_ms: 10,
            timeout_ms: 60_000,
            max_failures: 3,
        };
        let scheduler = PingScheduler::start(pinger.clone(), config, |_| {});

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pinger.pending_len(), 1);

        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.is_finished());
        assert_eq!(pinger.pending_len(), 0);
        Ok(())
    }

    struct Pong;

    #[async_trait::async_trait]
    impl RequestHandler for Pong {
        async fn handle_request(
            &self,
            method: &str,
            _params: Option<serde_json::Value>,
            _context: crate::runtime::MethodContext,
        ) -> Result<serde_json::Value, mcplink_jsonrpc::JsonRpcError> {
            match method {
                "ping" => Ok(serde_json::json!({})),
                other => Err(mcplink_jsonrpc::JsonRpcError::method_not_found(other)),
            }
        }
    }
}
