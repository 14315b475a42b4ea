//! Utility functions for the GATT queue
//!
//! Includes log setup and byte formatting helpers

/// Common utility functions
pub mod common {
    /// Hex dump of the first `max` bytes, with a length suffix when cut short
    pub fn hex_preview(bytes: &[u8], max: usize) -> String {
        if bytes.len() <= max {
            hex::encode(bytes)
        } else {
            format!("{}.. ({} bytes)", hex::encode(&bytes[..max]), bytes.len())
        }
    }
}

/// Tracing subscriber setup
pub mod logging {
    /// Map a config log level string to a tracing level, INFO when unknown
    pub fn parse_log_level(level: Option<&str>) -> tracing::Level {
        match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("trace") => tracing::Level::TRACE,
            Some("debug") => tracing::Level::DEBUG,
            Some("info") => tracing::Level::INFO,
            Some("warn") => tracing::Level::WARN,
            Some("error") => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Install the global fmt subscriber.
    ///
    /// Returns false if a subscriber was already installed (tests, host app).
    pub fn init(level: Option<&str>) -> bool {
        let level = parse_log_level(level);
        match tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .try_init()
        {
            Ok(_) => {
                tracing::info!("✅ Logging initialized at {}", level);
                true
            }
            Err(_) => false,
        }
    }
}
