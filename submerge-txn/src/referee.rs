//! Component J: optional external tie-breaker consulted when exactly
//! half of the configured nodes are connected (§4.10).
//!
//! Split into `get_winner`/`clear_winner` rather than one ad hoc
//! method: asking for a decision and forgetting one are distinct
//! operations with distinct failure handling.

use std::path::PathBuf;
use std::sync::RwLock;

use submerge_base::{err, Result};
use submerge_net::NodeID;
use tracing::warn;

/// The network seam to the external referee service. A real
/// implementation speaks whatever wire protocol the referee exposes;
/// the core only needs these two calls, mirroring `Bus`'s role for
/// the inter-node message bus.
pub trait RefereeTransport: Send + Sync {
    /// Asks the referee to pick a winner among the connected halves,
    /// from `my_node`'s point of view. `None` if the referee declined
    /// or couldn't be reached meaningfully (caller treats this as "no
    /// grant available").
    fn query_winner(&self, my_node: NodeID) -> Result<Option<NodeID>>;

    /// Tells the referee this node has seen full connectivity again
    /// and the prior decision should be forgotten cluster-wide.
    fn query_clear(&self) -> Result<bool>;
}

/// The winning node id the referee most recently granted, cached
/// until `clear_winner` succeeds (§4.10).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RefereeDecision {
    pub winner: NodeID,
}

/// A one-line on-disk cache of the current decision, so a reboot
/// doesn't have to re-contact the referee before resuming operation —
/// "on reboot, the cache is authoritative until the referee is
/// contacted again" (§4.10).
struct DecisionFile {
    path: PathBuf,
}

impl DecisionFile {
    fn read(&self) -> Option<NodeID> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        contents.trim().parse::<u8>().ok().map(NodeID)
    }

    fn write(&self, winner: NodeID) -> Result<()> {
        std::fs::write(&self.path, winner.get().to_string())?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct RefereeClient<T: RefereeTransport> {
    me: NodeID,
    transport: T,
    cache: RwLock<Option<NodeID>>,
    decision_file: DecisionFile,
}

impl<T: RefereeTransport> RefereeClient<T> {
    pub fn new(me: NodeID, transport: T, decision_path: impl Into<PathBuf>) -> Self {
        let decision_file = DecisionFile { path: decision_path.into() };
        let cache = decision_file.read();
        RefereeClient {
            me,
            transport,
            cache: RwLock::new(cache),
            decision_file,
        }
    }

    /// §4.10: returns the cached decision if one exists (without
    /// re-contacting the referee); otherwise queries it, persists a
    /// grant, and caches it.
    pub fn get_winner(&self) -> Result<Option<RefereeDecision>> {
        if let Some(winner) = *self.cache.read().unwrap() {
            return Ok(Some(RefereeDecision { winner }));
        }

        match self.transport.query_winner(self.me) {
            Ok(Some(winner)) => {
                if let Err(e) = self.decision_file.write(winner) {
                    warn!(error = ?e, "failed to persist referee decision, proceeding anyway");
                }
                *self.cache.write().unwrap() = Some(winner);
                Ok(Some(RefereeDecision { winner }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = ?e, "could not reach referee");
                Err(e)
            }
        }
    }

    /// Whether this node is the cached winner and so gets to fake a
    /// majority for clique/election purposes (§4.10).
    pub fn am_i_the_winner(&self) -> bool {
        self.cache.read().unwrap().map(|w| w == self.me).unwrap_or(false)
    }

    /// §4.10: clears the decision once full connectivity is restored.
    /// Clears the local cache first (matching the upstream ordering —
    /// losing the local copy while the referee's own record survives
    /// is recoverable by re-querying; the reverse isn't), then asks
    /// the referee to forget it. Returns whether the referee
    /// confirmed the clear.
    pub fn clear_winner(&self) -> Result<bool> {
        if let Err(e) = self.decision_file.clear() {
            warn!(error = ?e, "failed to clear local referee decision cache");
        }
        *self.cache.write().unwrap() = None;

        match self.transport.query_clear() {
            Ok(confirmed) => Ok(confirmed),
            Err(e) => {
                warn!(error = ?e, "could not reach referee to confirm clear");
                Err(e)
            }
        }
    }
}

/// A transport that always fails to connect — the default when
/// `Config::referee_conn_string` is `None` (§4.10 "inactive whenever a
/// true quorum is available" applies a fortiori when there's no
/// referee configured at all).
pub struct NoReferee;

impl RefereeTransport for NoReferee {
    fn query_winner(&self, _my_node: NodeID) -> Result<Option<NodeID>> {
        Err(err("no referee configured"))
    }

    fn query_clear(&self) -> Result<bool> {
        Err(err("no referee configured"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use test_log::test;

    struct FakeTransport {
        winner: Mutex<Option<NodeID>>,
        clear_calls: Mutex<u32>,
    }

    impl RefereeTransport for FakeTransport {
        fn query_winner(&self, _my_node: NodeID) -> Result<Option<NodeID>> {
            Ok(*self.winner.lock().unwrap())
        }
        fn query_clear(&self) -> Result<bool> {
            *self.clear_calls.lock().unwrap() += 1;
            Ok(true)
        }
    }

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("submerge-txn-referee-{name}-{:?}", std::time::SystemTime::now()));
        p
    }

    #[test]
    fn first_query_caches_and_persists_winner() {
        let transport = FakeTransport {
            winner: Mutex::new(Some(NodeID(1))),
            clear_calls: Mutex::new(0),
        };
        let client = RefereeClient::new(NodeID(1), transport, tmp_path("cache1"));
        let decision = client.get_winner().unwrap().unwrap();
        assert_eq!(decision.winner, NodeID(1));
        assert!(client.am_i_the_winner());
    }

    #[test]
    fn second_query_uses_cache_not_transport() {
        let transport = FakeTransport {
            winner: Mutex::new(Some(NodeID(2))),
            clear_calls: Mutex::new(0),
        };
        let client = RefereeClient::new(NodeID(1), transport, tmp_path("cache2"));
        client.get_winner().unwrap();
        *client.transport.winner.lock().unwrap() = Some(NodeID(99));
        let decision = client.get_winner().unwrap().unwrap();
        assert_eq!(decision.winner, NodeID(2));
    }

    #[test]
    fn clear_winner_resets_cache_and_confirms() {
        let transport = FakeTransport {
            winner: Mutex::new(Some(NodeID(1))),
            clear_calls: Mutex::new(0),
        };
        let client = RefereeClient::new(NodeID(1), transport, tmp_path("cache3"));
        client.get_winner().unwrap();
        let confirmed = client.clear_winner().unwrap();
        assert!(confirmed);
        assert!(!client.am_i_the_winner());
        assert_eq!(*client.transport.clear_calls.lock().unwrap(), 1);
    }

    #[test]
    fn cache_survives_reconstruction_from_disk() {
        let path = tmp_path("cache4");
        {
            let transport = FakeTransport {
                winner: Mutex::new(Some(NodeID(3))),
                clear_calls: Mutex::new(0),
            };
            let client = RefereeClient::new(NodeID(1), transport, path.clone());
            client.get_winner().unwrap();
        }
        let transport = FakeTransport {
            winner: Mutex::new(None),
            clear_calls: Mutex::new(0),
        };
        let client = RefereeClient::new(NodeID(1), transport, path.clone());
        let decision = client.get_winner().unwrap().unwrap();
        assert_eq!(decision.winner, NodeID(3));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn no_referee_transport_errors() {
        let client = RefereeClient::new(NodeID(1), NoReferee, tmp_path("cache5"));
        assert!(client.get_winner().is_err());
    }
}
