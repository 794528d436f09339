use std::net::SocketAddr;

use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

pub fn init_logger(level: tracing::Level) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty();
    tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_max_level(level)
        .init();
}

pub fn init_logger_with_filter(filter: impl Into<EnvFilter>) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .pretty()
        .with_file(false);
    tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .init();
}

/// Drops repeated contact points, keeping the first occurrence.
pub(crate) fn dedup_contact_points(
    contact_points: impl IntoIterator<Item = SocketAddr>,
) -> Vec<SocketAddr> {
    let mut seen = ahash::HashSet::default();
    contact_points
        .into_iter()
        .filter(|address| seen.insert(*address))
        .collect()
}
