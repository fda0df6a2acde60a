use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::ClientType;

use super::table::{LocalRouter, RoutingTable};

/// One visited route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub user_id: String,
    pub client_type: ClientType,
    pub router: LocalRouter,
}

/// Resumable cursor over the routing table.
///
/// The user ids are snapshotted when the cursor is created. When the cursor
/// reaches a user it notes which client types that user has, and each route
/// is looked up again in the live table at the moment it is yielded, then
/// copied out. Consequences:
///
/// - routes removed before the cursor reaches them are skipped, including
///   the remaining routes of a user the cursor stopped partway through;
/// - users added after the snapshot are never visited, so a broadcast
///   targets the users connected when it started;
/// - the cursor keeps its position across calls, so a caller can stop
///   mid-table and pick up from the same place later.
pub struct RouteCursor {
    table: Arc<RoutingTable>,
    user_ids: std::vec::IntoIter<String>,
    pending: VecDeque<(String, ClientType)>,
    snapshot_len: usize,
    visited_users: usize,
}

impl RouteCursor {
    pub(super) fn new(table: Arc<RoutingTable>, user_ids: Vec<String>) -> Self {
        let snapshot_len = user_ids.len();
        Self {
            table,
            user_ids: user_ids.into_iter(),
            pending: VecDeque::new(),
            snapshot_len,
            visited_users: 0,
        }
    }

    /// Whether anything is left to visit. May report `true` for users that
    /// have since disconnected; the next walk then simply finds nothing.
    pub fn has_next(&self) -> bool {
        !self.pending.is_empty() || !self.user_ids.as_slice().is_empty()
    }

    /// Number of users in the snapshot.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len
    }

    /// Number of snapshot users the cursor has moved past so far.
    pub fn visited_users(&self) -> usize {
        self.visited_users
    }

    fn load_next_user(&mut self) -> bool {
        for user_id in self.user_ids.by_ref() {
            self.visited_users += 1;
            let routes = self.table.lookup_all(&user_id);
            if routes.is_empty() {
                continue;
            }
            self.pending.extend(
                routes
                    .into_iter()
                    .map(|(client_type, _)| (user_id.clone(), client_type)),
            );
            return true;
        }
        false
    }
}

impl Iterator for RouteCursor {
    type Item = RouteEntry;

    fn next(&mut self) -> Option<RouteEntry> {
        loop {
            if self.pending.is_empty() && !self.load_next_user() {
                return None;
            }
            let Some((user_id, client_type)) = self.pending.pop_front() else {
                continue;
            };
            if let Some(router) = self.table.lookup(&user_id, client_type) {
                return Some(RouteEntry {
                    user_id,
                    client_type,
                    router,
                });
            }
        }
    }
}
