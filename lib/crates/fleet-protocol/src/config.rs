use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Timing defaults shared by the hub and agents.
pub mod defaults {
    /// Window in which AUTH must arrive after the socket upgrade
    pub const AUTH_TIMEOUT_SECS: u64 = 10;

    /// Silence after which a connection is declared dead
    pub const LIVENESS_WINDOW_SECS: u64 = 90;

    /// Agent PING cadence
    pub const PING_INTERVAL_SECS: u64 = 25;

    /// Agent STATUS heartbeat cadence
    pub const STATUS_INTERVAL_SECS: u64 = 60;

    /// Agent METRICS heartbeat cadence
    pub const METRICS_INTERVAL_SECS: u64 = 30;

    /// Reconnect backoff base
    pub const BACKOFF_BASE_MS: u64 = 1000;

    /// Reconnect backoff cap
    pub const BACKOFF_CAP_SECS: u64 = 60;

    /// Path of the agent socket endpoint on the hub
    pub const AGENT_WS_PATH: &str = "/agent/ws";
}

/// Characters left unescaped in query values (RFC 3986 unreserved).
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Build the agent socket URL: `<base>/agent/ws?device_id=<id>&owner_id=<id>`.
///
/// `base` is the hub origin, e.g. `wss://hub.example.com`; a trailing slash is tolerated.
#[must_use]
pub fn agent_ws_url(base: &str, device_id: &str, owner_id: &str) -> String {
    format!(
        "{}{}?device_id={}&owner_id={}",
        base.trim_end_matches('/'),
        defaults::AGENT_WS_PATH,
        utf8_percent_encode(device_id, QUERY_VALUE),
        utf8_percent_encode(owner_id, QUERY_VALUE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ws_url_joins_path_and_query() {
        assert_eq!(
            agent_ws_url("wss://hub.example.com", "d1", "o1"),
            "wss://hub.example.com/agent/ws?device_id=d1&owner_id=o1"
        );
    }

    #[test]
    fn agent_ws_url_tolerates_trailing_slash() {
        assert_eq!(
            agent_ws_url("ws://127.0.0.1:8080/", "d1", "o1"),
            "ws://127.0.0.1:8080/agent/ws?device_id=d1&owner_id=o1"
        );
    }

    #[test]
    fn agent_ws_url_escapes_query_values() {
        let url = agent_ws_url("wss://h", "d 1", "a&b");
        assert!(url.ends_with("device_id=d%201&owner_id=a%26b"), "{url}");
    }

    #[test]
    fn liveness_window_outlasts_several_pings() {
        assert!(defaults::LIVENESS_WINDOW_SECS >= 3 * defaults::PING_INTERVAL_SECS);
    }
}
