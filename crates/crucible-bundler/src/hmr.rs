use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Global HMR status, broadcast to registered listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HmrStatus {
    Idle,
    Check,
    Apply,
    Fail,
    Dispose,
}

/// Per-module HMR state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmrState {
    Idle,
    Dirty,
    Accepted,
    Declined,
    Disposed,
}

/// Per-module HMR configuration, driven by `module.hot` calls during
/// evaluation and by updates from the editor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HmrConfig {
    /// `hot.accept()` with no dependency: re-evaluate in place on the
    /// next dirty cycle
    pub self_accepted: bool,

    /// `hot.decline()`: a dirty declined module forces a hard reload
    pub declined: bool,

    /// Set by updates; cleared once the module has been re-evaluated
    pub dirty: bool,

    /// Set once the module has been torn down
    pub disposed: bool,
}

impl HmrConfig {
    /// Collapse the flags into the dominant state
    pub fn state(&self) -> HmrState {
        if self.disposed {
            HmrState::Disposed
        } else if self.dirty && self.declined {
            HmrState::Declined
        } else if self.dirty {
            HmrState::Dirty
        } else if self.declined {
            HmrState::Declined
        } else if self.self_accepted {
            HmrState::Accepted
        } else {
            HmrState::Idle
        }
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    /// Runtime registrations do not survive a re-evaluation; the module
    /// must call `hot.accept`/`hot.decline` again.
    pub fn reset_runtime_state(&mut self) {
        self.self_accepted = false;
        self.declined = false;
    }

    pub fn post_evaluate(&mut self) {
        self.dirty = false;
    }
}

/// Broadcast hub for HMR status changes
pub struct HmrBroadcast {
    tx: broadcast::Sender<HmrStatus>,
    current: std::cell::Cell<HmrStatus>,
}

impl HmrBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            current: std::cell::Cell::new(HmrStatus::Idle),
        }
    }

    /// Broadcast a status change to all listeners
    pub fn set_status(&self, status: HmrStatus) {
        if self.current.get() == status {
            return;
        }
        tracing::debug!("HMR status: {:?}", status);
        self.current.set(status);
        let _ = self.tx.send(status);
    }

    pub fn status(&self) -> HmrStatus {
        self.current.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HmrStatus> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for HmrBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_priority() {
        let mut config = HmrConfig::default();
        assert_eq!(config.state(), HmrState::Idle);

        config.self_accepted = true;
        assert_eq!(config.state(), HmrState::Accepted);

        config.dirty = true;
        assert_eq!(config.state(), HmrState::Dirty);

        config.declined = true;
        assert_eq!(config.state(), HmrState::Declined);

        config.disposed = true;
        assert_eq!(config.state(), HmrState::Disposed);
    }

    #[test]
    fn test_broadcast_dedupes_repeats() {
        let hub = HmrBroadcast::new();
        let mut rx = hub.subscribe();

        hub.set_status(HmrStatus::Check);
        hub.set_status(HmrStatus::Check);
        hub.set_status(HmrStatus::Idle);

        assert_eq!(rx.try_recv().unwrap(), HmrStatus::Check);
        assert_eq!(rx.try_recv().unwrap(), HmrStatus::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HmrStatus::Check).unwrap(),
            r#""check""#
        );
    }
}
