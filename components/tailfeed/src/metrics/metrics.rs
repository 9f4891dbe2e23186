use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter, register_int_gauge,
};

lazy_static! {
    pub static ref LINES_SHIPPED_TOTAL: IntCounter = register_int_counter!(
        "tailfeed_lines_shipped_total",
        "Total number of log lines acknowledged by the broker"
    )
    .unwrap();
    pub static ref BATCHES_SHIPPED_TOTAL: IntCounter = register_int_counter!(
        "tailfeed_batches_shipped_total",
        "Total number of batches acknowledged by the broker"
    )
    .unwrap();
    pub static ref SHIP_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "tailfeed_ship_retries_total",
        "Publish attempts retried after a transient broker error"
    )
    .unwrap();
    pub static ref TRACKED_FILES: IntGauge = register_int_gauge!(
        "tailfeed_tracked_files",
        "Files currently present in the position table"
    )
    .unwrap();
    pub static ref REAPED_FILES_TOTAL: IntCounter = register_int_counter!(
        "tailfeed_reaped_files_total",
        "Rotated files deleted after being fully shipped"
    )
    .unwrap();
    pub static ref POSITION_FLUSH_DURATION_SECONDS: Histogram = register_histogram!(
        "tailfeed_position_flush_duration_seconds",
        "Histogram of position file flush durations in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
    )
    .unwrap();
}
