//! Address sink feeding a tonic balance channel

use std::collections::HashSet;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;
use tracing::{debug, warn};

use super::AddressSink;
use crate::connection::DialOptions;

/// Publishes resolved address sets.
///
/// [`BalanceForwarder`] turns each published set into `Change::Insert` /
/// `Change::Remove` updates for `Channel::balance_channel`; anything else can
/// follow the set through [`BalanceSink::subscribe`].
pub struct BalanceSink {
    published: watch::Sender<Vec<String>>,
}

impl BalanceSink {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self { published }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.published.subscribe()
    }

    /// Last published address set.
    pub fn addresses(&self) -> Vec<String> {
        self.published.borrow().clone()
    }
}

impl Default for BalanceSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSink for BalanceSink {
    fn update_addresses(&self, addresses: Vec<String>) {
        self.published.send_replace(addresses);
    }
}

/// Diffs published address sets into balance channel updates.
pub(crate) struct BalanceForwarder {
    pub addresses: watch::Receiver<Vec<String>>,
    pub changes: mpsc::Sender<Change<String, Endpoint>>,
    pub options: DialOptions,
    pub token: CancellationToken,
}

impl BalanceForwarder {
    pub async fn run(mut self) {
        let mut current: HashSet<String> = HashSet::new();

        loop {
            let latest: Vec<String> = self.addresses.borrow_and_update().clone();
            for change in diff(&current, &latest, &self.options) {
                let sent = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return,
                    sent = self.changes.send(change) => sent,
                };
                if sent.is_err() {
                    debug!("Balance channel dropped, stopping forwarder");
                    return;
                }
            }
            current = latest.into_iter().collect();

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                changed = self.addresses.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Changes turning `current` into `latest`. Addresses that cannot form an
/// endpoint are skipped.
fn diff(
    current: &HashSet<String>,
    latest: &[String],
    options: &DialOptions,
) -> Vec<Change<String, Endpoint>> {
    let latest_set: HashSet<&String> = latest.iter().collect();
    let mut changes: Vec<Change<String, Endpoint>> = current
        .iter()
        .filter(|address| !latest_set.contains(address))
        .map(|address| Change::Remove(address.clone()))
        .collect();

    for address in latest.iter().filter(|a| !current.contains(*a)) {
        match options.endpoint(address) {
            Ok(endpoint) => changes.push(Change::Insert(address.clone(), endpoint)),
            Err(e) => warn!(address = %address, error = %e, "Skipping unusable address"),
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(addresses: &[&str]) -> HashSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    fn summarize(changes: &[Change<String, Endpoint>]) -> (Vec<String>, Vec<String>) {
        let mut inserted = Vec::new();
        let mut removed = Vec::new();
        for change in changes {
            match change {
                Change::Insert(key, _) => inserted.push(key.clone()),
                Change::Remove(key) => removed.push(key.clone()),
            }
        }
        removed.sort();
        (inserted, removed)
    }

    #[test]
    fn test_diff() {
        let options = DialOptions::default();
        let changes = diff(
            &set(&["10.0.0.1:1", "10.0.0.2:1"]),
            &["10.0.0.2:1".to_string(), "10.0.0.3:1".to_string()],
            &options,
        );
        let (inserted, removed) = summarize(&changes);
        assert_eq!(inserted, vec!["10.0.0.3:1"]);
        assert_eq!(removed, vec!["10.0.0.1:1"]);
    }

    #[test]
    fn test_diff_skips_unusable_address() {
        let changes = diff(
            &HashSet::new(),
            &["not a uri".to_string()],
            &DialOptions::default(),
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_sink_publishes() {
        let sink = BalanceSink::new();
        let rx = sink.subscribe();
        sink.update_addresses(vec!["a:1".to_string()]);
        assert_eq!(*rx.borrow(), vec!["a:1".to_string()]);
        assert_eq!(sink.addresses(), vec!["a:1".to_string()]);
    }

    #[tokio::test]
    async fn test_forwarder_emits_changes() {
        let sink = BalanceSink::new();
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let forwarder = BalanceForwarder {
            addresses: sink.subscribe(),
            changes: tx,
            options: DialOptions::default(),
            token: token.clone(),
        };
        let handle = tokio::spawn(forwarder.run());

        sink.update_addresses(vec!["127.0.0.1:7001".to_string()]);
        match rx.recv().await {
            Some(Change::Insert(key, _)) => assert_eq!(key, "127.0.0.1:7001"),
            _ => panic!("expected insert"),
        }

        sink.update_addresses(vec!["127.0.0.1:7002".to_string()]);
        let mut seen = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(Change::Insert(key, _)) => seen.push(format!("+{}", key)),
                Some(Change::Remove(key)) => seen.push(format!("-{}", key)),
                None => break,
            }
        }
        assert_eq!(seen, vec!["-127.0.0.1:7001", "+127.0.0.1:7002"]);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_feeds_balance_channel() {
        let sink = BalanceSink::new();
        let (_channel, changes) = tonic::transport::Channel::balance_channel::<String>(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            BalanceForwarder {
                addresses: sink.subscribe(),
                changes,
                options: DialOptions::default(),
                token: token.clone(),
            }
            .run(),
        );

        sink.update_addresses(vec!["127.0.0.1:7001".to_string()]);
        sink.update_addresses(vec!["127.0.0.1:7002".to_string()]);
        tokio::task::yield_now().await;

        token.cancel();
        handle.await.unwrap();
    }
}
