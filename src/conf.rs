use crate::error::{Error, Result};

/// Database connection parameters.
///
/// A plain value type: nothing is validated here. Bad credentials or an
/// unreachable host only surface when a connection is attempted.
#[derive(Clone, Debug)]
pub struct Conf {
    /// Log every statement at debug level, plus open/close events.
    pub debug_logging: bool,
    /// Refuse destructive operations such as `drop_table`.
    pub safe_mode: bool,
    /// Open the connection immediately in `Orm::create`.
    pub auto_open: bool,

    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub database: String,
    pub dialect: String,
    /// When non-empty, used verbatim instead of the discrete fields above.
    pub connection_string: String,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            debug_logging: true,
            safe_mode: true,
            auto_open: true,
            username: String::new(),
            password: String::new(),
            hostname: String::new(),
            port: 0,
            database: String::new(),
            dialect: "sqlite".to_string(),
            connection_string: String::new(),
        }
    }
}

impl Conf {
    /// Resolve the URL handed to the driver.
    ///
    /// The `connection_string` override always wins. Otherwise the URL is
    /// derived from the discrete fields for the configured dialect; only
    /// `sqlite` is wired to the bundled driver, anything else is rejected
    /// here rather than at connect time.
    pub fn connection_url(&self) -> Result<String> {
        if !self.connection_string.is_empty() {
            return Ok(self.connection_string.clone());
        }
        match self.dialect.as_str() {
            "sqlite" => {
                if self.database.is_empty() {
                    Ok("sqlite::memory:".to_string())
                } else {
                    Ok(format!("sqlite://{}?mode=rwc", self.database))
                }
            }
            other => Err(Error::UnsupportedDialect(other.to_string())),
        }
    }

    /// The conventional DSN for server dialects, built from the discrete
    /// fields: `user:pass@tcp(host:port)/db?charset=utf8&parseTime=True&loc=Local`.
    pub fn server_dsn(&self) -> String {
        format!(
            "{}:{}@tcp({}:{})/{}?charset=utf8&parseTime=True&loc=Local",
            self.username, self.password, self.hostname, self.port, self.database
        )
    }
}
