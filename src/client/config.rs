use crate::{method::Method, CONNECTION_SERVICE_NAME};

#[cfg(doc)]
use super::Client;

/// Configuration parameters for the [`Client`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The user to authenticate as.
    pub user: String,

    /// The service to start once authenticated.
    pub service: String,

    /// The methods to be tried first, in order of preference, if supported by the server.
    pub preferred: Vec<Method>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: String::new(),
            service: CONNECTION_SERVICE_NAME.into(),
            preferred: vec![
                Method::Publickey,
                Method::Password,
                Method::KeyboardInteractive,
            ],
        }
    }
}
