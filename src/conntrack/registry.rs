use crate::conntrack::connection::Connection;
use crate::conntrack::packet::PacketInfo;
use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;

// ID-keyed table of live connections. The table is the authoritative
// index; workers and external callers hold their own references.
pub(crate) struct ConnectionTable {
    entries: DashMap<String, Arc<Connection>>,
}

impl ConnectionTable {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn add(&self, conn: Arc<Connection>) {
        self.entries.insert(conn.id.clone(), conn);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.entries.remove(id).map(|(_, conn)| conn)
    }

    pub(crate) fn list(&self) -> Vec<Arc<Connection>> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

lazy_static! {
    static ref CONNS: ConnectionTable = ConnectionTable::new();
    static ref DNS_CONNS: ConnectionTable = ConnectionTable::new();
}

pub(crate) fn ip_table() -> &'static ConnectionTable {
    &CONNS
}

pub(crate) fn dns_table() -> &'static ConnectionTable {
    &DNS_CONNS
}

// Fetches an IP connection by its flow ID.
pub fn get_connection(id: &str) -> Option<Arc<Connection>> {
    CONNS.get(id)
}

// Fetches a DNS request connection by its ID.
pub fn get_dns_connection(id: &str) -> Option<Arc<Connection>> {
    DNS_CONNS.get(id)
}

pub fn get_all_connections() -> Vec<Arc<Connection>> {
    CONNS.list()
}

pub fn get_all_dns_connections() -> Vec<Arc<Connection>> {
    DNS_CONNS.list()
}

pub fn connection_counts() -> (usize, usize) {
    (CONNS.len(), DNS_CONNS.len())
}

// Looks up the DNS request connection pre-registered for the querying
// socket described by the given packet info.
pub fn get_dns_request_connection(info: &PacketInfo) -> Option<Arc<Connection>> {
    DNS_CONNS.get(&info.connection_id())
}

// Snapshot of all IP connections owned by the given PID, e.g. for
// re-evaluation after a profile change.
pub async fn get_connections_of_pid(pid: i32) -> Vec<Arc<Connection>> {
    let conns = CONNS.list();
    let guards = futures::future::join_all(conns.iter().map(|conn| conn.lock())).await;
    conns
        .iter()
        .zip(guards.iter())
        .filter(|(_, state)| state.pid == pid)
        .map(|(conn, _)| conn.clone())
        .collect()
}

#[cfg(test)]
pub(crate) fn clear_tables() {
    CONNS.clear();
    DNS_CONNS.clear();
}
