//! Reducer transitions over the notification list.
//!
//! Every optimistic mutation is a [`Command`]; applying it returns the
//! [`Inverse`] that undoes exactly that change, so a failed remote call can be
//! rolled back without re-deriving anything.

use std::collections::HashSet;

use super::models::Notification;

/// The list plus the separately tracked server total.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationList {
    pub items: Vec<Notification>,
    pub total: usize,
    pub max_len: usize,
}

impl NotificationList {
    pub fn new(max_len: usize) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            max_len,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|n| n.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    /// Prepends unless the id is already present.
    pub fn push_front(&mut self, notification: Notification) -> bool {
        if self.contains(&notification.id) {
            return false;
        }
        self.items.insert(0, notification);
        self.total += 1;
        self.enforce_cap();
        true
    }

    /// Appends a later page, skipping ids already present.
    pub fn extend(&mut self, page: Vec<Notification>, total: Option<usize>) {
        let mut seen: HashSet<String> = self.items.iter().map(|n| n.id.clone()).collect();
        for notification in page {
            if seen.insert(notification.id.clone()) {
                self.items.push(notification);
            }
        }
        if let Some(total) = total {
            self.total = total;
        }
        self.enforce_cap();
    }

    /// Replaces the server-issued entries, keeping `keep` (local notices)
    /// interleaved by creation time.
    pub fn replace(&mut self, page: Vec<Notification>, total: Option<usize>, keep: Vec<Notification>) {
        let server_total = total.unwrap_or(page.len());
        let mut seen = HashSet::new();
        let mut items: Vec<Notification> = page
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .collect();
        let kept = keep.len();
        items.extend(keep.into_iter().filter(|n| seen.insert(n.id.clone())));
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.items = items;
        self.total = server_total + kept;
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        self.items.truncate(self.max_len);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    MarkRead(String),
    MarkAllRead,
    Dismiss(String),
    ClearAll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inverse {
    Unmark(Vec<String>),
    Reinsert {
        index: usize,
        notification: Notification,
    },
    Restore(NotificationList),
}

impl Command {
    /// Commands the server applies to every notification it holds, loaded or
    /// not.
    pub fn is_server_wide(&self) -> bool {
        matches!(self, Command::MarkAllRead | Command::ClearAll)
    }

    /// Applies the command. `None` means nothing changed.
    pub fn apply(&self, list: &mut NotificationList) -> Option<Inverse> {
        match self {
            Command::MarkRead(id) => {
                let n = list.items.iter_mut().find(|n| &n.id == id && !n.read)?;
                n.read = true;
                Some(Inverse::Unmark(vec![id.clone()]))
            }
            Command::MarkAllRead => {
                let changed: Vec<String> = list
                    .items
                    .iter_mut()
                    .filter(|n| !n.read)
                    .map(|n| {
                        n.read = true;
                        n.id.clone()
                    })
                    .collect();
                (!changed.is_empty()).then_some(Inverse::Unmark(changed))
            }
            Command::Dismiss(id) => {
                let index = list.items.iter().position(|n| &n.id == id)?;
                let notification = list.items.remove(index);
                list.total = list.total.saturating_sub(1);
                Some(Inverse::Reinsert {
                    index,
                    notification,
                })
            }
            Command::ClearAll => {
                if list.items.is_empty() && list.total == 0 {
                    return None;
                }
                let snapshot = list.clone();
                list.items.clear();
                list.total = 0;
                Some(Inverse::Restore(snapshot))
            }
        }
    }
}

impl Inverse {
    pub fn revert(self, list: &mut NotificationList) {
        match self {
            Inverse::Unmark(ids) => {
                for n in list.items.iter_mut().filter(|n| ids.contains(&n.id)) {
                    n.read = false;
                }
            }
            Inverse::Reinsert {
                index,
                notification,
            } => {
                if list.contains(&notification.id) {
                    return;
                }
                let index = index.min(list.items.len());
                list.items.insert(index, notification);
                list.total += 1;
                list.enforce_cap();
            }
            Inverse::Restore(snapshot) => *list = snapshot,
        }
    }

    /// Ids whose remote state the command touched.
    pub fn affected_ids(&self) -> Vec<&str> {
        match self {
            Inverse::Unmark(ids) => ids.iter().map(String::as_str).collect(),
            Inverse::Reinsert { notification, .. } => vec![notification.id.as_str()],
            Inverse::Restore(snapshot) => snapshot.items.iter().map(|n| n.id.as_str()).collect(),
        }
    }
}
