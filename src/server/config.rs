use futures_time::time::Duration;

use crate::CONNECTION_SERVICE_NAME;

#[cfg(doc)]
use super::Server;

/// Configuration parameters for the [`Server`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The time given to the peer to authenticate, before being disconnected.
    pub login_timeout: Duration,

    /// The number of failed attempts tolerated, the next one causes a disconnection.
    pub attempts_before_disconnect: u32,

    /// The delay before answering an invalid password, to slow down guessing.
    pub password_delay: Duration,

    /// The banner text to be displayed upon authentication (the string should be `\r\n` terminated).
    pub banner: Option<String>,

    /// The services that can be started once authenticated.
    pub services: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(10 * 60),
            attempts_before_disconnect: 20,
            password_delay: Duration::from_secs(1),
            banner: None,
            services: vec![CONNECTION_SERVICE_NAME.into()],
        }
    }
}
