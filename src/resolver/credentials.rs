//! Quota-aware rotation over matcher API keys.
//!
//! Keys are handed out round-robin.  A key that answers with a quota or
//! rate-limit error is parked for a cooldown; when every key is parked the
//! pool reports exhaustion and the caller reschedules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub index: usize,
    pub key: String,
}

pub struct CredentialPool {
    keys: Vec<String>,
    next: AtomicUsize,
    /// key index → parked until
    parked: Mutex<HashMap<usize, Instant>>,
    cooldown: Duration,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Self {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        info!("Credential pool: {} key(s), cooldown {:?}", keys.len(), cooldown);
        CredentialPool {
            keys,
            next: AtomicUsize::new(0),
            parked: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Next usable key, or `None` when all are parked.
    pub fn acquire(&self) -> Option<Credential> {
        if self.keys.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.retain(|_, until| *until > now);

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..self.keys.len())
            .map(|offset| (start + offset) % self.keys.len())
            .find(|idx| !parked.contains_key(idx))
            .map(|index| Credential {
                index,
                key: self.keys[index].clone(),
            })
    }

    /// Take a key out of rotation for the cooldown.
    pub fn park(&self, credential: &Credential) {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.insert(credential.index, Instant::now() + self.cooldown);
        warn!(
            "Matcher key #{} parked for {:?} ({} of {} parked)",
            credential.index,
            self.cooldown,
            parked.len(),
            self.keys.len()
        );
    }

    pub fn available(&self) -> usize {
        let now = Instant::now();
        let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        let live_parked = parked.values().filter(|until| **until > now).count();
        self.keys.len().saturating_sub(live_parked)
    }
}
