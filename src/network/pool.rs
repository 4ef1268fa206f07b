// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{Connection, ConnectionId};
use crate::{AppError, AppResult};

/// Registry of live connections, keyed by UUID, used for fan-out.
///
/// The pool holds the retained handle of every member. Connections that
/// close are not dropped automatically; the owner removes them, usually
/// from `on_disconnect`, or sweeps with [`ConnectionPool::prune_closed`].
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            connections: DashMap::new(),
        }
    }

    pub fn add_connection(&self, connection: Connection) -> AppResult<()> {
        match self.connections.entry(connection.uuid()) {
            Entry::Occupied(entry) => Err(AppError::DuplicateUuid(*entry.key())),
            Entry::Vacant(entry) => {
                debug!(connection = %connection.uuid(), "connection added to pool");
                entry.insert(connection);
                Ok(())
            }
        }
    }

    pub fn remove_connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    /// Removes `connection` only if the pool holds that very handle, so a
    /// refused connection sharing an id cannot evict the member.
    pub fn remove_member(&self, connection: &Connection) -> bool {
        self.connections
            .remove_if(&connection.uuid(), |_, member| member.same_as(connection))
            .is_some()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sends `message` to every member except `excluded`, in no particular
    /// order. A failed send is logged and skipped; the rest still get the
    /// message. Returns how many members accepted it.
    pub fn send_all_except(&self, message: Bytes, excluded: &ConnectionId) -> usize {
        // snapshot so no shard lock is held while sending
        let targets: Vec<Connection> = self
            .connections
            .iter()
            .filter(|entry| entry.key() != excluded)
            .map(|entry| entry.value().clone())
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(cause = %err, "broadcast skipped a connection"),
            }
        }
        delivered
    }

    /// Drops every member that reports closed. Returns the removed ids.
    pub fn prune_closed(&self) -> Vec<ConnectionId> {
        let closed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        for id in &closed {
            self.connections.remove(id);
        }
        if !closed.is_empty() {
            debug!("pruned {} closed connections", closed.len());
        }
        closed
    }

    /// Closes and removes every member.
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                connection.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn members(n: usize) -> (ConnectionPool, Vec<(Connection, async_channel::Receiver<Bytes>)>) {
        let pool = ConnectionPool::new();
        let members: Vec<_> = (0..n).map(|_| Connection::detached(8)).collect();
        for (connection, _) in &members {
            pool.add_connection(connection.clone()).unwrap();
        }
        (pool, members)
    }

    #[test]
    fn test_add_rejects_duplicate_uuid() {
        let pool = ConnectionPool::new();
        let (connection, _rx) = Connection::detached(8);
        pool.add_connection(connection.clone()).unwrap();

        let err = pool.add_connection(connection.clone()).unwrap_err();
        assert!(matches!(err, AppError::DuplicateUuid(id) if id == connection.uuid()));
        assert_eq!(pool.len(), 1);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn test_send_all_except_skips_sender(#[case] n: usize) {
        let (pool, members) = members(n);
        let sender = members[0].0.uuid();

        let delivered = pool.send_all_except(Bytes::from_static(b"hi"), &sender);
        assert_eq!(delivered, n - 1);

        assert!(members[0].1.try_recv().is_err());
        for (_, rx) in &members[1..] {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"hi"));
        }
    }

    #[test]
    fn test_failed_member_does_not_stop_broadcast() {
        let (pool, mut members) = members(4);
        let sender = members[0].0.uuid();

        // member 1 has lost its writer, member 2 is closed
        let (_, dead_rx) = members.remove(1);
        drop(dead_rx);
        members[1].0.close();

        let delivered = pool.send_all_except(Bytes::from_static(b"payload"), &sender);
        assert_eq!(delivered, 1);
        assert_eq!(
            members[2].1.try_recv().unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[test]
    fn test_prune_and_remove() {
        let (pool, members) = members(3);
        members[1].0.close();

        let pruned = pool.prune_closed();
        assert_eq!(pruned, vec![members[1].0.uuid()]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&members[1].0.uuid()));

        let removed = pool.remove_connection(&members[0].0.uuid()).unwrap();
        assert_eq!(removed.uuid(), members[0].0.uuid());
        assert!(pool.remove_connection(&members[0].0.uuid()).is_none());
        assert!(pool.get(&members[2].0.uuid()).is_some());
    }

    #[test]
    fn test_remove_member_checks_handle() {
        let (pool, members) = members(1);
        let member = &members[0].0;
        let (twin, _twin_rx) = Connection::detached_twin(member, 8);

        assert!(!pool.remove_member(&twin));
        assert!(pool.contains(&member.uuid()));
        assert!(pool.remove_member(member));
        assert!(pool.is_empty());
        assert!(!pool.remove_member(member));
    }

    #[test]
    fn test_close_all_empties_pool() {
        let (pool, members) = members(3);
        pool.close_all();
        assert!(pool.is_empty());
        assert!(members.iter().all(|(connection, _)| connection.is_closed()));
    }
}
