//! Local routing table: user id → (client type → route).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::connection::{ClientType, Connection};

use super::cursor::RouteCursor;

/// A route to one of a user's locally held connections.
///
/// Holds a handle to the connection, not ownership; the transport may close
/// it at any time.
#[derive(Clone)]
pub struct LocalRouter {
    connection: Arc<dyn Connection>,
    client_type: ClientType,
}

impl LocalRouter {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let client_type = connection.session_context().client_type;
        Self {
            connection,
            client_type,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }
}

impl std::fmt::Debug for LocalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRouter")
            .field("connection_id", &self.connection.id())
            .field("client_type", &self.client_type)
            .finish()
    }
}

/// Process-wide table of locally connected users.
///
/// Uses `DashMap` for shard-level concurrency. Callers never get a guard
/// back; every read copies the routes out so no shard lock outlives the
/// call. This is what lets a broadcast unregister stale routes while it is
/// walking the table.
pub struct RoutingTable {
    routes: DashMap<String, HashMap<ClientType, LocalRouter>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Register a route for `(user_id, router.client_type())`, returning the
    /// route it displaced, if any.
    pub fn register(&self, user_id: &str, router: LocalRouter) -> Option<LocalRouter> {
        let mut entry = self.routes.entry(user_id.to_string()).or_default();
        entry.insert(router.client_type(), router)
    }

    /// Remove the route for `(user_id, client_type)`.
    pub fn unregister(&self, user_id: &str, client_type: ClientType) -> Option<LocalRouter> {
        match self.routes.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&client_type);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Remove the route for `(user_id, client_type)` only if it still points
    /// at `connection_id`. A user who reconnected in the meantime keeps the
    /// new route.
    pub fn unregister_connection(
        &self,
        user_id: &str,
        client_type: ClientType,
        connection_id: &str,
    ) -> bool {
        match self.routes.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let matches = entry
                    .get()
                    .get(&client_type)
                    .is_some_and(|r| r.connection().id() == connection_id);
                if !matches {
                    return false;
                }
                entry.get_mut().remove(&client_type);
                if entry.get().is_empty() {
                    entry.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn lookup(&self, user_id: &str, client_type: ClientType) -> Option<LocalRouter> {
        self.routes
            .get(user_id)
            .and_then(|routes| routes.get(&client_type).cloned())
    }

    /// All routes for a user, ordered by client type.
    pub fn lookup_all(&self, user_id: &str) -> Vec<(ClientType, LocalRouter)> {
        let mut routes: Vec<(ClientType, LocalRouter)> = self
            .routes
            .get(user_id)
            .map(|routes| routes.iter().map(|(ct, r)| (*ct, r.clone())).collect())
            .unwrap_or_default();
        routes.sort_by_key(|(ct, _)| *ct as u8);
        routes
    }

    pub fn user_count(&self) -> usize {
        self.routes.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.iter().map(|entry| entry.value().len()).sum()
    }

    /// Snapshot the users currently in the table and return a resumable
    /// cursor over their routes.
    pub fn routers(self: &Arc<Self>) -> RouteCursor {
        let user_ids: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        RouteCursor::new(self.clone(), user_ids)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::StubConnection;

    fn router(id: &str, user: &str, os: &str) -> LocalRouter {
        LocalRouter::new(Arc::new(StubConnection::new(id, user, os)))
    }

    #[test]
    fn register_and_lookup() {
        let table = RoutingTable::new();
        assert!(table.register("u1", router("c1", "u1", "android")).is_none());
        assert!(table.register("u1", router("c2", "u1", "windows")).is_none());

        let mobile = table.lookup("u1", ClientType::Mobile).unwrap();
        assert_eq!(mobile.connection().id(), "c1");
        assert_eq!(table.lookup_all("u1").len(), 2);
        assert_eq!(table.user_count(), 1);
        assert_eq!(table.route_count(), 2);
    }

    #[test]
    fn register_same_client_type_displaces_previous() {
        let table = RoutingTable::new();
        table.register("u1", router("c1", "u1", "android"));
        let displaced = table.register("u1", router("c2", "u1", "ios")).unwrap();
        assert_eq!(displaced.connection().id(), "c1");
        assert_eq!(table.route_count(), 1);
    }

    #[test]
    fn unregister_removes_empty_users() {
        let table = RoutingTable::new();
        table.register("u1", router("c1", "u1", "android"));
        let removed = table.unregister("u1", ClientType::Mobile).unwrap();
        assert_eq!(removed.connection().id(), "c1");
        assert_eq!(table.user_count(), 0);
        assert!(table.unregister("u1", ClientType::Mobile).is_none());
    }

    #[test]
    fn unregister_connection_ignores_replaced_route() {
        let table = RoutingTable::new();
        table.register("u1", router("old", "u1", "android"));
        table.register("u1", router("new", "u1", "android"));

        assert!(!table.unregister_connection("u1", ClientType::Mobile, "old"));
        assert_eq!(
            table.lookup("u1", ClientType::Mobile).unwrap().connection().id(),
            "new"
        );
        assert!(table.unregister_connection("u1", ClientType::Mobile, "new"));
        assert_eq!(table.user_count(), 0);
    }

    #[test]
    fn lookup_unknown_user_is_empty() {
        let table = RoutingTable::new();
        assert!(table.lookup("ghost", ClientType::Web).is_none());
        assert!(table.lookup_all("ghost").is_empty());
    }
}
