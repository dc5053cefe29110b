//! OS integration and formatting helpers.

use std::time::Duration;

use crate::types::LinkType;

mod discovery;
mod probe;

pub use discovery::*;
pub use probe::*;

/// Guess the link type from an interface name.
pub fn guess_link_type(name: &str) -> LinkType {
    let name = name.to_lowercase();

    if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wl") || name.starts_with("ath") {
        LinkType::Wireless
    } else if name.starts_with("eth")
        || name.starts_with("enp")
        || name.starts_with("eno")
        || name.starts_with("ens")
        || name.starts_with("enx")
        || name.starts_with("em")
    {
        LinkType::Wired
    } else if name.starts_with("en") {
        // macOS: en0 is usually WiFi on laptops
        LinkType::Wireless
    } else {
        LinkType::Other
    }
}

/// Format a rate in bytes per second as human-readable.
pub fn format_rate(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}

/// Format duration as human-readable.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let ms = duration.subsec_millis();

    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{secs}.{ms:03}s")
    } else {
        format!("{ms}ms")
    }
}
