//! Cancellable asynchronous host name resolution
//!
//! One [`HostLookup`] performs one resolution at a time. Starting a new
//! query on a session with a pending query aborts the pending one first,
//! so a stale completion can never be misattributed to the new query.
//! Success and failure share a single completion channel; cancellation
//! delivers nothing at all.

use std::cell::Cell;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::constants::RESOLVED_ADDRESS_TTL;

/// Completion message for one lookup
#[derive(Debug, Clone)]
pub struct LookupResult {
    /// The hostname the lookup was started with
    pub label: String,
    /// Resolved addresses in resolution order; empty on failure
    pub addresses: Vec<Ipv4Addr>,
    /// Conservative freshness lifetime; the platform resolver exposes no
    /// authoritative TTL
    pub ttl: Duration,
    /// True for a genuine resolution failure (never for cancellation)
    pub failed: bool,
}

/// Pluggable resolve function, so tests can substitute a slow or failing
/// resolver for the system one
pub type ResolveFn = Rc<dyn Fn(String) -> LocalBoxFuture<'static, io::Result<Vec<IpAddr>>>>;

/// The system resolver: `getaddrinfo` via tokio's thread pool
pub fn system_resolver() -> ResolveFn {
    Rc::new(|label: String| {
        async move {
            let addrs = tokio::net::lookup_host((label.as_str(), 0u16)).await?;
            Ok(addrs.map(|sa| sa.ip()).collect())
        }
        .boxed_local()
    })
}

/// A reusable lookup session
///
/// Must live on the loop thread; the off-thread part of resolution is
/// fully contained inside the resolve future.
pub struct HostLookup {
    label: Option<String>,
    generation: Rc<Cell<u64>>,
    task: Option<JoinHandle<()>>,
    results: UnboundedSender<LookupResult>,
    resolve: ResolveFn,
}

impl HostLookup {
    /// Create a session that resolves through the system resolver
    pub fn new(results: UnboundedSender<LookupResult>) -> Self {
        Self::with_resolver(results, system_resolver())
    }

    /// Create a session with a custom resolve function
    pub fn with_resolver(results: UnboundedSender<LookupResult>, resolve: ResolveFn) -> Self {
        Self {
            label: None,
            generation: Rc::new(Cell::new(0)),
            task: None,
            results,
            resolve,
        }
    }

    /// The label of the current (or last) query
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Whether a query is still in flight
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start resolving `label`, aborting any pending query first.
    ///
    /// Exactly one [`LookupResult`] is delivered per successful or failed
    /// query; an aborted query delivers nothing. Must be called on the
    /// loop thread, inside a `LocalSet`.
    pub fn start(&mut self, label: &str) {
        self.abort();
        self.label = Some(label.to_string());

        let generation = self.generation.clone();
        let issued = generation.get();
        let results = self.results.clone();
        let future = (self.resolve)(label.to_string());
        let label = label.to_string();

        self.task = Some(tokio::task::spawn_local(async move {
            let outcome = future.await;
            if generation.get() != issued {
                // Superseded while the resolve future was in flight.
                return;
            }
            let (addresses, failed) = match outcome {
                Ok(addrs) => {
                    let v4 = addrs
                        .into_iter()
                        .filter_map(|addr| match addr {
                            IpAddr::V4(v4) => Some(v4),
                            IpAddr::V6(_) => None,
                        })
                        .collect();
                    (v4, false)
                }
                Err(e) => {
                    tracing::warn!("host lookup for {label} failed: {e}");
                    (Vec::new(), true)
                }
            };
            let _ = results.send(LookupResult {
                label,
                addresses,
                ttl: RESOLVED_ADDRESS_TTL,
                failed,
            });
        }));
    }

    /// Cancel the in-flight query, if any.
    ///
    /// The cancellation token is invalidated synchronously: once this
    /// returns, the aborted query can no longer deliver a result even if
    /// the underlying OS operation is still running.
    pub fn abort(&mut self) {
        self.generation.set(self.generation.get() + 1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HostLookup {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::oneshot;

    type Gates = Rc<RefCell<HashMap<String, oneshot::Sender<io::Result<Vec<IpAddr>>>>>>;

    /// Resolver that completes only when the test releases its gate
    fn gated_resolver(gates: Gates) -> ResolveFn {
        Rc::new(move |label: String| {
            let (tx, rx) = oneshot::channel();
            gates.borrow_mut().insert(label, tx);
            async move { rx.await.unwrap_or_else(|_| Ok(Vec::new())) }.boxed_local()
        })
    }

    fn release(gates: &Gates, label: &str, outcome: io::Result<Vec<IpAddr>>) {
        if let Some(tx) = gates.borrow_mut().remove(label) {
            let _ = tx.send(outcome);
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn v4(s: &str) -> IpAddr {
        s.parse::<Ipv4Addr>().unwrap().into()
    }

    #[tokio::test]
    async fn test_successful_lookup_delivers_ordered_addresses() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("peer.example.org");
                settle().await;
                assert!(lookup.is_pending());

                release(
                    &gates,
                    "peer.example.org",
                    Ok(vec![v4("192.0.2.1"), v4("192.0.2.2")]),
                );
                settle().await;

                let result = rx.try_recv().unwrap();
                assert_eq!(result.label, "peer.example.org");
                assert_eq!(
                    result.addresses,
                    vec!["192.0.2.1".parse::<Ipv4Addr>().unwrap(), "192.0.2.2".parse().unwrap()]
                );
                assert!(!result.failed);
                assert_eq!(result.ttl, RESOLVED_ADDRESS_TTL);
                assert!(rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_restart_discards_stale_completion() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("slow.example.org");
                settle().await;
                lookup.start("fast.example.org");
                settle().await;

                // The first query completes only after the second one has
                // been issued; its result must be discarded.
                release(&gates, "slow.example.org", Ok(vec![v4("198.51.100.1")]));
                settle().await;
                assert!(rx.try_recv().is_err());

                release(&gates, "fast.example.org", Ok(vec![v4("198.51.100.2")]));
                settle().await;

                let result = rx.try_recv().unwrap();
                assert_eq!(result.label, "fast.example.org");
                assert_eq!(result.addresses, vec!["198.51.100.2".parse::<Ipv4Addr>().unwrap()]);
                assert!(rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_abort_delivers_nothing() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("peer.example.org");
                settle().await;
                lookup.abort();

                release(&gates, "peer.example.org", Ok(vec![v4("192.0.2.1")]));
                settle().await;

                assert!(rx.try_recv().is_err());
                assert!(!lookup.is_pending());
            })
            .await;
    }

    #[tokio::test]
    async fn test_failure_sets_flag_and_empty_result() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("nxdomain.example.org");
                settle().await;
                release(
                    &gates,
                    "nxdomain.example.org",
                    Err(io::Error::new(io::ErrorKind::NotFound, "host not found")),
                );
                settle().await;

                let result = rx.try_recv().unwrap();
                assert!(result.failed);
                assert!(result.addresses.is_empty());
                assert_eq!(result.label, "nxdomain.example.org");
            })
            .await;
    }

    #[tokio::test]
    async fn test_filters_to_ipv4() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("dual.example.org");
                settle().await;
                release(
                    &gates,
                    "dual.example.org",
                    Ok(vec![
                        "2001:db8::1".parse::<IpAddr>().unwrap(),
                        v4("203.0.113.7"),
                    ]),
                );
                settle().await;

                let result = rx.try_recv().unwrap();
                assert_eq!(result.addresses, vec!["203.0.113.7".parse::<Ipv4Addr>().unwrap()]);
                assert!(!result.failed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_session_reuse_keeps_completion_order() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let gates: Gates = Rc::new(RefCell::new(HashMap::new()));
                let (tx, mut rx) = unbounded_channel();
                let mut lookup = HostLookup::with_resolver(tx, gated_resolver(gates.clone()));

                lookup.start("first.example.org");
                settle().await;
                release(&gates, "first.example.org", Ok(vec![v4("192.0.2.1")]));
                settle().await;

                lookup.start("second.example.org");
                settle().await;
                release(&gates, "second.example.org", Ok(vec![v4("192.0.2.2")]));
                settle().await;

                assert_eq!(rx.try_recv().unwrap().label, "first.example.org");
                assert_eq!(rx.try_recv().unwrap().label, "second.example.org");
                assert!(rx.try_recv().is_err());
            })
            .await;
    }
}
