//! [`Connector`] implementation that opens MySQL connections for a pool.

use sqlwire_core::{Connector, Result};

use crate::config::MySqlConfig;
use crate::connection::MySqlConnection;
use crate::stream::MySqlStream;

/// Opens a fresh [`MySqlConnection`] from a fixed config on every call.
#[derive(Clone)]
pub struct MySqlConnector {
    config: MySqlConfig,
}

impl MySqlConnector {
    /// The config is validated here so a misconfigured pool fails at startup
    /// rather than on its first acquire.
    pub fn new(config: MySqlConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl Connector for MySqlConnector {
    type Connection = MySqlConnection<MySqlStream>;

    fn connect(&self) -> Result<Self::Connection> {
        tracing::debug!(
            host = %self.config.host,
            port = self.config.port,
            "opening pooled MySQL connection"
        );
        MySqlConnection::connect(self.config.clone())
    }
}

impl std::fmt::Debug for MySqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnector")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslMode;

    #[test]
    fn rejects_invalid_config() {
        let config = MySqlConfig::new().user("app").ssl_mode(SslMode::VerifyCa);
        assert!(MySqlConnector::new(config).is_err());
    }

    #[test]
    fn debug_hides_password() {
        let config = MySqlConfig::new().user("app").password("hunter2");
        let connector = MySqlConnector::new(config).unwrap();
        let shown = format!("{connector:?}");
        assert!(shown.contains("app"));
        assert!(!shown.contains("hunter2"));
    }
}
