//! The notifications hub.
//!
//! Sessions subscribe to receive server-initiated notifications
//! (`list_changed`, progress). Delivery is best-effort per session: a
//! full or closed channel drops the notification for that session and
//! never rolls back the mutation that triggered it.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use sonar_core::{RpcNotification, SessionId};

/// Channel capacity per subscribed session.
const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Which list a `list_changed` notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangedKind {
    /// The tool list.
    Tools,
    /// The resource list.
    Resources,
    /// The prompt list.
    Prompts,
}

impl ListChangedKind {
    /// The notification method name for this kind.
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Resources => "notifications/resources/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
        }
    }
}

/// Per-session notification fan-out.
pub struct NotificationHub {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<RpcNotification>>>,
}

impl NotificationHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe a session; returns the receiver its transport drains.
    ///
    /// Re-subscribing an existing session replaces its channel.
    pub fn subscribe(&self, session: SessionId) -> mpsc::Receiver<RpcNotification> {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(session, tx);
        }
        rx
    }

    /// Drop a session's subscription.
    pub fn unsubscribe(&self, session: &SessionId) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(session);
        }
    }

    /// Number of subscribed sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Broadcast a `list_changed` for the given kind to every session.
    ///
    /// Returns the number of sessions the notification was queued for.
    pub fn list_changed(&self, kind: ListChangedKind) -> usize {
        self.notify_all(RpcNotification::new(kind.method(), None))
    }

    /// Broadcast an arbitrary notification to every session.
    ///
    /// Best-effort: sessions with full or closed channels are skipped.
    pub fn notify_all(&self, notification: RpcNotification) -> usize {
        let Ok(sessions) = self.sessions.read() else {
            return 0;
        };
        let mut delivered = 0usize;
        for (session, tx) in sessions.iter() {
            match tx.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    trace!(session = %session, error = %e, "Dropped notification");
                },
            }
        }
        debug!(
            method = %notification.method,
            delivered,
            total = sessions.len(),
            "Broadcast notification"
        );
        delivered
    }

    /// Send a notification to one session.
    ///
    /// Returns `false` if the session is unknown or its channel is
    /// unavailable.
    pub fn notify_session(&self, session: &SessionId, notification: RpcNotification) -> bool {
        let Ok(sessions) = self.sessions.read() else {
            return false;
        };
        sessions
            .get(session)
            .is_some_and(|tx| tx.try_send(notification).is_ok())
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_changed_reaches_every_session() {
        let hub = NotificationHub::new();
        let a = SessionId::generate();
        let b = SessionId::generate();
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        assert_eq!(hub.list_changed(ListChangedKind::Tools), 2);

        let n = rx_a.recv().await.unwrap();
        assert_eq!(n.method, "notifications/tools/list_changed");
        let n = rx_b.recv().await.unwrap();
        assert_eq!(n.method, "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_broadcast() {
        let hub = NotificationHub::new();
        let dead = SessionId::generate();
        let live = SessionId::generate();
        drop(hub.subscribe(dead));
        let mut rx = hub.subscribe(live);

        // Only the live session counts.
        assert_eq!(hub.list_changed(ListChangedKind::Prompts), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = NotificationHub::new();
        let session = SessionId::generate();
        let _rx = hub.subscribe(session.clone());
        hub.unsubscribe(&session);
        assert_eq!(hub.list_changed(ListChangedKind::Resources), 0);
    }

    #[tokio::test]
    async fn notify_session_targets_one() {
        let hub = NotificationHub::new();
        let a = SessionId::generate();
        let b = SessionId::generate();
        let mut rx_a = hub.subscribe(a.clone());
        let mut rx_b = hub.subscribe(b);

        assert!(hub.notify_session(&a, RpcNotification::new("notifications/progress", None)));
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }
}
