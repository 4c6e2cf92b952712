use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// Process-wide handling counters. Kept as plain atomics so the hot path
// never takes a lock.
static PACKETS_HANDLED: AtomicU64 = AtomicU64::new(0);
static HANDLING_MICROS_TOTAL: AtomicU64 = AtomicU64::new(0);
static HANDLING_MICROS_MAX: AtomicU64 = AtomicU64::new(0);
static IP_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static DNS_REQUESTS: AtomicU64 = AtomicU64::new(0);
static PACKETS_DROPPED: AtomicU64 = AtomicU64::new(0);

// Records the time from kernel interception to the end of handling.
pub fn record_packet_handling(seen_at: DateTime<Utc>) {
    let micros = (Utc::now() - seen_at).num_microseconds().unwrap_or(0).max(0) as u64;
    PACKETS_HANDLED.fetch_add(1, Ordering::Relaxed);
    HANDLING_MICROS_TOTAL.fetch_add(micros, Ordering::Relaxed);
    HANDLING_MICROS_MAX.fetch_max(micros, Ordering::Relaxed);
}

pub fn count_ip_connection() {
    IP_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn count_dns_request() {
    DNS_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn count_dropped_packet() {
    PACKETS_DROPPED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlingMetrics {
    pub packets_handled: u64,
    pub handling_micros_total: u64,
    pub handling_micros_max: u64,
    pub ip_connections: u64,
    pub dns_requests: u64,
    pub packets_dropped: u64,
}

pub fn snapshot() -> HandlingMetrics {
    HandlingMetrics {
        packets_handled: PACKETS_HANDLED.load(Ordering::Relaxed),
        handling_micros_total: HANDLING_MICROS_TOTAL.load(Ordering::Relaxed),
        handling_micros_max: HANDLING_MICROS_MAX.load(Ordering::Relaxed),
        ip_connections: IP_CONNECTIONS.load(Ordering::Relaxed),
        dns_requests: DNS_REQUESTS.load(Ordering::Relaxed),
        packets_dropped: PACKETS_DROPPED.load(Ordering::Relaxed),
    }
}
