use std::collections::HashMap;
use std::time::Duration;

use brokerlink_domain::Capabilities;

// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process broker.
///
/// All fields default to a fully capable broker that accepts any credentials
/// and connects instantly.
#[derive(Debug, Clone)]
pub struct SimConfig {
    // ---
    /// What the simulated client library supports.
    pub capabilities: Capabilities,

    pub product_name: String,
    pub product_version: String,

    /// Accepted `user -> password` pairs. `None` = no authentication.
    pub users: Option<HashMap<String, Option<String>>>,

    /// Added to every connection attempt. Tests connect timing with it.
    pub connect_delay: Option<Duration>,

    /// How often blocked receivers and dispatchers re-check their state.
    pub poll_interval: Duration,
}

// ---

impl Default for SimConfig {
    fn default() -> Self {
        // ---
        Self {
            capabilities: Capabilities {
                xa: true,
                context_api: true,
                simplified_session: true,
            },
            product_name: "brokerlink-sim".to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            users: None,
            connect_delay: None,
            poll_interval: Duration::from_millis(20),
        }
    }
}

// ---

impl SimConfig {
    // ---
    /// Fully capable broker. Useful as a baseline.
    pub fn capable() -> Self {
        Self::default()
    }

    // ---

    /// Client library without XA support.
    pub fn non_xa() -> Self {
        // ---
        Self {
            capabilities: Capabilities {
                xa: false,
                context_api: true,
                simplified_session: true,
            },
            ..Default::default()
        }
    }

    // ---

    /// Older client library: no XA, no contexts, no simplified sessions.
    pub fn legacy() -> Self {
        // ---
        Self {
            capabilities: Capabilities::default(),
            product_version: "1.1".to_string(),
            ..Default::default()
        }
    }

    // ---

    /// Require one of the given `(user, password)` pairs on connect.
    pub fn with_users<'a>(mut self, users: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        // ---
        self.users = Some(
            users
                .into_iter()
                .map(|(u, p)| (u.to_string(), p.map(str::to_string)))
                .collect(),
        );
        self
    }
}
