//! Delivery notifications.
//!
//! Listeners are held in a copy-on-write list: registration swaps in a new
//! list, and every notification round works on the snapshot taken when it
//! started.

use std::{
    fmt::Debug,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use courier_spool::{DeliveryState, MailId, QueueEntry};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// What a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// The recipient was delivered to.
    Sent,
    /// The recipient was given up on.
    Failed,
    /// Every recipient of the message is settled.
    Finished,
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
        })
    }
}

pub trait DeliveryListener: Send + Sync + Debug {
    /// Called once per outcome. Must not block.
    fn delivered(&self, mail_id: &MailId, recipient: &str, kind: ResultKind, info: &str);
}

#[derive(Debug, Default)]
pub struct ListenerManager {
    listeners: Mutex<Arc<Vec<Arc<dyn DeliveryListener>>>>,
}

impl ListenerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DeliveryListener>) {
        let mut listeners = self.listeners.lock();
        let mut next: Vec<_> = listeners.iter().cloned().collect();
        next.push(listener);
        *listeners = Arc::new(next);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn DeliveryListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let next: Vec<_> = listeners
            .iter()
            .filter(|registered| !Arc::ptr_eq(registered, listener))
            .cloned()
            .collect();

        let removed = next.len() != listeners.len();
        *listeners = Arc::new(next);
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report a released entry: its own terminal outcome if it has one, then
    /// `Finished` when the whole message just completed.
    pub fn notify(&self, entry: &QueueEntry, completed: bool) {
        let kind = match entry.state() {
            DeliveryState::Sent => Some(ResultKind::Sent),
            DeliveryState::Failed => Some(ResultKind::Failed),
            DeliveryState::Queued | DeliveryState::InProgress => None,
        };

        if kind.is_none() && !completed {
            return;
        }

        let snapshot = Arc::clone(&*self.listeners.lock());
        let info = entry.result_info.as_deref().unwrap_or_default();

        for listener in snapshot.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(kind) = kind {
                    listener.delivered(&entry.mail_id, &entry.recipient, kind, info);
                }
                if completed {
                    listener.delivered(&entry.mail_id, &entry.recipient, ResultKind::Finished, info);
                }
            }));

            if outcome.is_err() {
                error!(
                    mail_id = %entry.mail_id,
                    recipient = %entry.recipient,
                    listener = ?listener,
                    "Listener panicked"
                );
            }
        }

        trace!(
            mail_id = %entry.mail_id,
            recipient = %entry.recipient,
            listeners = snapshot.len(),
            completed,
            "Notified listeners"
        );
    }
}

/// One notification, as forwarded by [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub mail_id: MailId,
    pub recipient: String,
    pub kind: ResultKind,
    pub info: String,
}

/// Forwards notifications into an unbounded channel for async observers.
#[derive(Debug)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelListener {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DeliveryListener for ChannelListener {
    fn delivered(&self, mail_id: &MailId, recipient: &str, kind: ResultKind, info: &str) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.sender.send(Notification {
            mail_id: mail_id.clone(),
            recipient: recipient.to_string(),
            kind,
            info: info.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry() -> QueueEntry {
        let now = Utc::now();
        let mut entry = QueueEntry::new(
            MailId::from("1700000000.0"),
            "user@example.com".to_string(),
            0,
            None,
            now,
        );
        entry.begin_attempt(now).unwrap();
        entry
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<(ResultKind, String)> {
        let mut seen = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            seen.push((notification.kind, notification.info));
        }
        seen
    }

    #[test]
    fn test_sent_then_finished() {
        let manager = ListenerManager::new();
        let (listener, mut receiver) = ChannelListener::new();
        manager.add(Arc::new(listener));

        let mut entry = entry();
        entry.mark_sent(Utc::now(), "250 OK").unwrap();
        manager.notify(&entry, true);

        assert_eq!(
            drain(&mut receiver),
            vec![
                (ResultKind::Sent, "250 OK".to_string()),
                (ResultKind::Finished, "250 OK".to_string()),
            ]
        );
    }

    #[test]
    fn test_requeued_entries_are_silent() {
        let manager = ListenerManager::new();
        let (listener, mut receiver) = ChannelListener::new();
        manager.add(Arc::new(listener));

        let now = Utc::now();
        let mut entry = entry();
        entry.requeue(now, 5, now).unwrap();
        manager.notify(&entry, false);

        assert!(drain(&mut receiver).is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let manager = ListenerManager::new();
        let (first, mut first_rx) = ChannelListener::new();
        let (second, mut second_rx) = ChannelListener::new();
        let first: Arc<dyn DeliveryListener> = Arc::new(first);
        manager.add(Arc::clone(&first));
        manager.add(Arc::new(second));
        assert_eq!(manager.len(), 2);

        assert!(manager.remove(&first));
        assert!(!manager.remove(&first));
        assert_eq!(manager.len(), 1);

        let mut entry = entry();
        entry.mark_failed(Utc::now(), "550 No such user").unwrap();
        manager.notify(&entry, false);

        assert!(drain(&mut first_rx).is_empty());
        assert_eq!(
            drain(&mut second_rx),
            vec![(ResultKind::Failed, "550 No such user".to_string())]
        );
    }

    #[derive(Debug)]
    struct Panicking;

    impl DeliveryListener for Panicking {
        fn delivered(&self, _: &MailId, _: &str, _: ResultKind, _: &str) {
            panic!("listener failed");
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_the_round() {
        let manager = ListenerManager::new();
        let (listener, mut receiver) = ChannelListener::new();
        manager.add(Arc::new(Panicking));
        manager.add(Arc::new(listener));

        let mut entry = entry();
        entry.mark_sent(Utc::now(), "250 OK").unwrap();
        manager.notify(&entry, true);

        assert_eq!(
            drain(&mut receiver),
            vec![
                (ResultKind::Sent, "250 OK".to_string()),
                (ResultKind::Finished, "250 OK".to_string()),
            ]
        );
    }

    #[derive(Debug)]
    struct Registering {
        manager: Arc<ListenerManager>,
    }

    impl DeliveryListener for Registering {
        fn delivered(&self, _: &MailId, _: &str, _: ResultKind, _: &str) {
            let (listener, _receiver) = ChannelListener::new();
            self.manager.add(Arc::new(listener));
        }
    }

    #[test]
    fn test_registration_during_notification() {
        let manager = Arc::new(ListenerManager::new());
        manager.add(Arc::new(Registering {
            manager: Arc::clone(&manager),
        }));

        let mut entry = entry();
        entry.mark_sent(Utc::now(), "250 OK").unwrap();
        manager.notify(&entry, true);

        // Two callbacks on the snapshot, each registering one more listener.
        assert_eq!(manager.len(), 3);
    }
}
