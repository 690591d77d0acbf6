//! Connection configuration for the underlying log service (Redis).

use std::fmt::Debug;

use redis::{Client, Commands, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo};
use tracing::{debug, error};

use crate::error::{BrokerError, BrokerResult};

/// Credentials to authenticate to the log service, if it requires them.
#[derive(Clone)]
pub struct ClientCredentials {
    user: String,
    password: String,
}

impl ClientCredentials {
    pub fn get_user(&self) -> &str {
        &self.user
    }

    pub fn get_password(&self) -> &str {
        &self.password
    }

    pub fn new(user: &str, password: &str) -> ClientCredentials {
        ClientCredentials {
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }
}

impl Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

/// Connection parameters for a single log-service client.
///
/// Connection URL format: `redis://[<user>][:<password>@]<host>:<port>/<db>`.
#[derive(Debug, Clone)]
pub struct ClientArgs {
    credentials: Option<ClientCredentials>,
    host: String,
    port: u16,
    db: i64,
}

impl ClientArgs {
    pub fn get_credentials(&self) -> &Option<ClientCredentials> {
        &self.credentials
    }

    pub fn get_host(&self) -> &str {
        &self.host
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn get_db(&self) -> i64 {
        self.db
    }

    pub fn new(
        credentials: Option<ClientCredentials>,
        host: &str,
        port: u16,
        db: i64,
    ) -> ClientArgs {
        ClientArgs {
            credentials,
            host: host.to_owned(),
            port,
            db,
        }
    }

    /// Build [`ClientArgs`] from `REDIS_HOST` / `REDIS_PORT` / `REDIS_DB` /
    /// `REDIS_USER` / `REDIS_PASSWORD` environment variables.
    ///
    /// `REDIS_HOST` defaults to `localhost`, `REDIS_PORT` to `6379`, `REDIS_DB`
    /// to `0`. `REDIS_USER` and `REDIS_PASSWORD` are both required, or both
    /// absent, to build [`ClientCredentials`]; any other combination is a
    /// configuration error.
    pub fn from_env() -> BrokerResult<ClientArgs> {
        let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());

        let port: u16 = match std::env::var("REDIS_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| BrokerError::Config(format!("REDIS_PORT is not a valid port: {raw}")))?,
            Err(_) => 6379,
        };

        let db: i64 = match std::env::var("REDIS_DB") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| BrokerError::Config(format!("REDIS_DB is not a valid database index: {raw}")))?,
            Err(_) => 0,
        };

        let user = std::env::var("REDIS_USER").ok();
        let password = std::env::var("REDIS_PASSWORD").ok();

        let credentials = match (user, password) {
            (Some(user), Some(password)) => Some(ClientCredentials::new(&user, &password)),
            (None, None) => None,
            _ => {
                return Err(BrokerError::Config(
                    "REDIS_USER and REDIS_PASSWORD must be set together".to_string(),
                ))
            }
        };

        Ok(ClientArgs::new(credentials, &host, port, db))
    }
}

/// Build a new [`Client`] from [`ClientArgs`].
pub trait ClientBuilder {
    fn build(&self) -> BrokerResult<Client>;
}

impl ClientBuilder for ClientArgs {
    fn build(&self) -> BrokerResult<Client> {
        let addr = ConnectionAddr::Tcp(self.get_host().to_string(), self.get_port());

        let username = self.get_credentials().as_ref().map(|c| c.get_user().to_string());
        let password = self
            .get_credentials()
            .as_ref()
            .map(|c| c.get_password().to_string());

        let redis_info = RedisConnectionInfo {
            db: self.get_db(),
            username,
            password,
            ..Default::default()
        };

        Ok(Client::open(ConnectionInfo {
            addr,
            redis: redis_info,
        })?)
    }
}

/// Verify the connection to the log service with a `PING`.
pub trait VerifyConnection {
    fn ping(&mut self) -> BrokerResult<String>;
}

impl<C> VerifyConnection for C
where
    C: Commands,
{
    fn ping(&mut self) -> BrokerResult<String> {
        match self.check_connection() {
            true => {
                debug!("log service connection verified");
                Ok("PONG".into())
            }
            false => {
                let msg = "could not verify connection to the log service";
                error!(msg);
                Err(BrokerError::Redis(redis::RedisError::from((
                    ErrorKind::ClientError,
                    "could not verify connection to the log service",
                ))))
            }
        }
    }
}
