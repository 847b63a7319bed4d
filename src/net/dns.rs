//! DNS seed resolution. Pluggable and best-effort: failures are logged
//! and skipped, never fatal to the pool.

use crate::net::types::{NetAddress, SERVICE_NETWORK};
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Cap per discovery round; keeps one hot seed from flooding the book.
const MAX_PER_SEED: usize = 64;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve every seed, tagging results with the default port and the
/// baseline service assumption.
pub async fn resolve_seeds(seeds: &[String], port: u16) -> Vec<NetAddress> {
    let mut out = Vec::new();
    for seed in seeds {
        let query = format!("{seed}:{port}");
        let result = tokio::time::timeout(LOOKUP_TIMEOUT, lookup_host(query)).await;
        match result {
            Ok(Ok(addrs)) => {
                let mut found: Vec<NetAddress> = addrs
                    .take(MAX_PER_SEED)
                    .map(|sa| NetAddress::from_socket_addr(sa, SERVICE_NETWORK))
                    .collect();
                debug!("seed {} resolved {} addresses", seed, found.len());
                out.append(&mut found);
            }
            Ok(Err(e)) => warn!("seed {} failed: {}", seed, e),
            Err(_) => warn!("seed {} timed out", seed),
        }
    }
    out.shuffle(&mut rand::thread_rng());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_localhost() {
        let addrs = resolve_seeds(&["localhost".to_string()], 8333).await;
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port == 8333));
    }

    #[tokio::test]
    async fn bad_seed_is_skipped() {
        let addrs =
            resolve_seeds(&["no-such-host.invalid".to_string()], 8333).await;
        assert!(addrs.is_empty());
    }
}
