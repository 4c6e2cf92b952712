use crate::conntrack::connection::Connection;
use crate::rwlock::CustomRwLock;
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DB_SCOPE_IP: &str = "ip";
pub const DB_SCOPE_DNS: &str = "dns";

pub fn make_key(pid: i32, db_scope: &str, id: &str) -> String {
    format!("network:tree/{}/{}/{}", pid, db_scope, id)
}

// Storage metadata of a connection record. The key is computed on first
// save; an empty key means the record has never been persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMeta {
    pub key: String,
    pub created: i64,
    pub modified: i64,
    pub deleted: bool,
}

impl RecordMeta {
    pub fn update(&mut self) {
        let now = Utc::now().timestamp();
        if self.created == 0 {
            self.created = now;
        }
        self.modified = now;
    }

    pub fn is_key_set(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn set_key(&mut self, key: String) {
        self.key = key;
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.modified = Utc::now().timestamp();
    }
}

// Downstream consumer of connection updates: the database layer, which
// persists the record and pushes it to subscribed UIs.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn push_update(&self, conn: &Arc<Connection>);
}

lazy_static! {
    static ref UPDATE_SINK: CustomRwLock<Option<Arc<dyn UpdateSink>>> = CustomRwLock::new(None);
}

pub async fn set_update_sink(sink: Arc<dyn UpdateSink>) {
    *UPDATE_SINK.write().await = Some(sink);
}

pub async fn push_update(conn: &Arc<Connection>) {
    if let Some(sink) = UPDATE_SINK.read().await.as_ref() {
        sink.push_update(conn).await;
    }
}
