//! Metric label keys and fixed values

/// Broker host label
pub const SERVER: &str = "server";
/// Queue name label
pub const QUEUE: &str = "queue";
/// Error kind label
pub const KIND: &str = "kind";
/// Negotiated security label
pub const SECURITY: &str = "security";
/// Handler disposition label
pub const DISPOSITION: &str = "disposition";
/// Who cancelled a consumer
pub const ORIGIN: &str = "origin";
/// Why the reconnect loop stopped
pub const REASON: &str = "reason";

/// Consumer cancelled by this client
pub const ORIGIN_CLIENT: &str = "client";
/// Consumer cancelled by the broker
pub const ORIGIN_BROKER: &str = "broker";
