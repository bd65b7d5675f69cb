use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::types::{ExecutionToken, RunId};

/// Mints and redeems single-use execution tokens.
///
/// A token is live from `mint` until it is redeemed, revoked or expires.
/// Redeeming a token whose fields do not match the minted one fails without
/// consuming it.
pub struct TokenIssuer {
    ttl: chrono::Duration,
    live: Mutex<HashMap<String, ExecutionToken>>,
}

impl TokenIssuer {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs.min(i64::MAX as u64) as i64),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn mint(&self, run_id: &RunId, node_id: &str, attempt: u32) -> ExecutionToken {
        let token = ExecutionToken::mint(run_id, node_id, attempt, self.ttl);
        if let Ok(mut live) = self.live.lock() {
            live.insert(token.nonce.clone(), token.clone());
        }
        token
    }

    pub fn redeem(&self, token: &ExecutionToken) -> Result<()> {
        let mut live = self
            .live
            .lock()
            .map_err(|e| WeftError::stale(&token.node_id, e.to_string()))?;
        match live.get(&token.nonce) {
            None => Err(WeftError::stale(&token.node_id, "unknown or already redeemed")),
            Some(minted) if minted != token => {
                Err(WeftError::stale(&token.node_id, "token does not match the minted one"))
            }
            Some(minted) if minted.is_expired() => {
                live.remove(&token.nonce);
                Err(WeftError::stale(&token.node_id, "token expired"))
            }
            Some(_) => {
                live.remove(&token.nonce);
                Ok(())
            }
        }
    }

    /// Drop every live token of a run.
    pub fn revoke_run(&self, run_id: &RunId) {
        if let Ok(mut live) = self.live.lock() {
            let before = live.len();
            live.retain(|_, t| t.run_id != run_id.0);
            debug!(run_id = %run_id, revoked = before - live.len(), "Tokens revoked");
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }
}
