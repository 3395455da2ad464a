use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tally_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tally_query_duration_seconds";

/// Counter: reservations confirmed.
pub const RESERVATIONS_CONFIRMED_TOTAL: &str = "tally_reservations_confirmed_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "tally_reservations_cancelled_total";

/// Counter: capacity-race losers (SlotFull returned).
pub const SLOT_FULL_TOTAL: &str = "tally_slot_full_total";

/// Counter: exhausted-entitlement rejections.
pub const INSUFFICIENT_CREDITS_TOTAL: &str = "tally_insufficient_credits_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tally_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tally_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tally_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tally_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tally_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertMember { .. } => "insert_member",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::CloseSubscription { .. } => "close_subscription",
        Command::InsertEntitlements { .. } => "insert_entitlements",
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::RetireResource { .. } => "retire_resource",
        Command::InsertSlot { .. } => "insert_slot",
        Command::RetireSlot { .. } => "retire_slot",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::MarkAttended { .. } => "mark_attended",
        Command::MarkNoShow { .. } => "mark_no_show",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectMemberReservations { .. } => "select_member_reservations",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectLedger { .. } => "select_ledger",
        Command::SelectResources => "select_resources",
        Command::Listen { .. } => "listen",
    }
}
