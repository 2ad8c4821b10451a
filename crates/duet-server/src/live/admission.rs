//! Per-identity admission control for live sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duet_core::UserId;
use duet_settings::DeliverySettings;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_sessions: usize,
    /// Minimum gap after an identity's last accepted session.
    pub cooldown: Duration,
    /// Retry hint for rejections at the session cap.
    pub retry_after: Duration,
}

impl AdmissionConfig {
    pub fn from_settings(delivery: &DeliverySettings) -> Self {
        Self {
            max_sessions: delivery.max_sessions_per_identity,
            cooldown: delivery.connect_cooldown(),
            retry_after: delivery.retry_after(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            cooldown: Duration::from_secs(1),
            retry_after: Duration::from_secs(2),
        }
    }
}

/// A retryable rejection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("too many live sessions ({active}) for this identity")]
    TooMany { active: usize, retry_after: Duration },

    #[error("session requests are arriving too quickly")]
    TooFrequent { retry_after: Duration },
}

impl AdmissionError {
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::TooMany { retry_after, .. } | Self::TooFrequent { retry_after } => *retry_after,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooMany { .. } => "too_many",
            Self::TooFrequent { .. } => "too_frequent",
        }
    }
}

struct Slot {
    active: usize,
    last_accepted: Instant,
}

/// Session counters keyed by identity. Check-and-increment happens under
/// one lock, so concurrent requests cannot both pass the cap.
pub struct Admission {
    config: AdmissionConfig,
    slots: Mutex<HashMap<UserId, Slot>>,
}

impl Admission {
    pub fn new(config: AdmissionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Admit a new session for `identity` or explain why not. The returned
    /// permit releases its slot when dropped.
    pub fn try_admit(self: &Arc<Self>, identity: &UserId) -> Result<AdmissionPermit, AdmissionError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(identity) {
            if slot.active >= self.config.max_sessions {
                return Err(AdmissionError::TooMany {
                    active: slot.active,
                    retry_after: self.config.retry_after,
                });
            }
            let since = now.duration_since(slot.last_accepted);
            if since < self.config.cooldown {
                return Err(AdmissionError::TooFrequent {
                    retry_after: self.config.cooldown - since,
                });
            }
            slot.active += 1;
            slot.last_accepted = now;
        } else {
            let _ = slots.insert(
                identity.clone(),
                Slot {
                    active: 1,
                    last_accepted: now,
                },
            );
        }
        debug!(%identity, "session admitted");
        Ok(AdmissionPermit {
            admission: Arc::clone(self),
            identity: identity.clone(),
        })
    }

    fn release(&self, identity: &UserId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(identity) {
            slot.active = slot.active.saturating_sub(1);
            if slot.active == 0 {
                let _ = slots.remove(identity);
            }
        }
    }

    /// Live sessions currently counted for `identity`.
    pub fn active(&self, identity: &UserId) -> usize {
        self.slots.lock().get(identity).map_or(0, |s| s.active)
    }
}

/// Held by a live session for its whole lifetime.
pub struct AdmissionPermit {
    admission: Arc<Admission>,
    identity: UserId,
}

impl AdmissionPermit {
    pub fn identity(&self) -> &UserId {
        &self.identity
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.release(&self.identity);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
