use std::time::Instant;
use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use cadence::StatsdClient;
use deadpool::managed::{Manager, PoolConfig, Timeouts};
use deadpool::Runtime;
use google_cloud_rust_raw::bigtable::v2::bigtable_grpc::BigtableClient;
use grpcio::{Channel, ChannelBuilder, ChannelCredentials, EnvBuilder, Environment};

use crate::error::{BigtableError, BigtableResult};
use crate::settings::BigtableDbSettings;

/// Default max concurrent channels.
const DEFAULT_POOL_MAX_SIZE: usize = 4;
/// Per-RPC send and receive message cap, 256 MiB.
const MAX_MESSAGE_LEN: i32 = 1 << 28;

/// One pooled connection: a channel and the generated client riding it.
pub struct BigtableDb {
    pub conn: BigtableClient,
    /// when this connection was created
    pub created: Instant,
    /// last time this connection was handed out
    pub used: Instant,
}

impl BigtableDb {
    pub fn new(channel: Channel) -> Self {
        Self {
            conn: BigtableClient::new(channel),
            created: Instant::now(),
            used: Instant::now(),
        }
    }
}

/// The pool of Bigtable clients.
///
/// Bigtable uses HTTP/2 as the backbone, so the only really important bit
/// that we have control over is the "channel". Each pooled object carries its
/// own channel; the pool is shared by every table handle and mutated only at
/// open/close.
#[derive(Clone)]
pub struct BigtablePool {
    pub pool: deadpool::managed::Pool<BigtableClientManager>,
    _metrics: Arc<StatsdClient>,
}

impl fmt::Debug for BigtablePool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("BigtablePool").finish()
    }
}

impl BigtablePool {
    /// Get a new managed connection from the pool.
    pub async fn get(
        &self,
    ) -> BigtableResult<deadpool::managed::Object<BigtableClientManager>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BigtableError::Pool(e.to_string()))?;
        conn.used = Instant::now();
        Ok(conn)
    }

    /// Creates a new pool of Bigtable connections.
    pub fn new(settings: &BigtableDbSettings, metrics: &Arc<StatsdClient>) -> BigtableResult<Self> {
        let endpoint = &settings.dsn;
        debug!("🉑 DSN: {}", &endpoint);
        // Url::parse() doesn't know how to handle the `grpc:` scheme, so the
        // host comes back piecewise.
        let parsed = url::Url::parse(endpoint).map_err(|e| {
            BigtableError::Connection(format!("Invalid DSN: {endpoint:?} : {e:?}"))
        })?;
        let origin = format!(
            "{}:{}",
            parsed.host_str().ok_or_else(|| BigtableError::Connection(format!(
                "Invalid DSN: Unparsable host {endpoint:?}"
            )))?,
            parsed.port().unwrap_or(443)
        );
        if !parsed.path().is_empty() {
            return Err(BigtableError::Connection(format!(
                "Invalid DSN: Table paths belong in settings : {endpoint:?}"
            )));
        }
        debug!("🉑 connection string {}", &origin);

        // Construct a new manager and put them in a pool for handling future
        // requests.
        let manager = BigtableClientManager::new(settings, settings.dsn.clone(), origin);
        let mut config = PoolConfig::default();
        config.max_size = settings
            .database_pool_max_size
            .map(|size| size as usize)
            .unwrap_or(DEFAULT_POOL_MAX_SIZE);
        debug!("🏊 Pool max size {}", &config.max_size);
        if let Some(timeout) = settings.database_pool_connection_timeout {
            debug!("🏊 Setting connection timeout to {} milliseconds", &timeout);
            config.timeouts = Timeouts {
                create: Some(Duration::from_millis(timeout as u64)),
                ..Default::default()
            };
        }
        let pool = deadpool::managed::Pool::builder(manager)
            .config(config)
            // timeouts need a runtime to count against
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BigtableError::Pool(e.to_string()))?;

        Ok(Self {
            pool,
            _metrics: metrics.clone(),
        })
    }

    /// Close the pool. Outstanding operations fail; this is a one-way door,
    /// called once at shutdown.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Bigtable pool manager. This contains everything needed to create a new
/// connection.
pub struct BigtableClientManager {
    settings: BigtableDbSettings,
    dsn: String,
    connection: String,
    env: Arc<Environment>,
}

impl BigtableClientManager {
    fn new(settings: &BigtableDbSettings, dsn: String, connection: String) -> Self {
        Self {
            settings: settings.clone(),
            dsn,
            connection,
            env: Arc::new(EnvBuilder::new().build()),
        }
    }
}

impl fmt::Debug for BigtableClientManager {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("deadpool::BtClientManager")
            .field("settings", &self.settings.clone())
            .finish()
    }
}

#[async_trait]
impl Manager for BigtableClientManager {
    type Error = BigtableError;
    type Type = BigtableDb;

    /// Create a new Bigtable client with its own channel.
    /// `BigtableClient` is the most atomic we can go.
    async fn create(&self) -> Result<BigtableDb, BigtableError> {
        debug!("🏊 Create a new pool entry.");
        let channel = self.create_channel()?.connect(self.connection.as_str());
        Ok(BigtableDb::new(channel))
    }

    /// Recycle if the connection has outlived its lifespan.
    async fn recycle(
        &self,
        client: &mut Self::Type,
        _metrics: &deadpool::managed::Metrics,
    ) -> deadpool::managed::RecycleResult<Self::Error> {
        if let Some(ttl) = self.settings.database_pool_connection_ttl {
            if Instant::now() - client.created > Duration::from_millis(ttl as u64) {
                debug!("🏊 Recycle requested (old).");
                return Err(BigtableError::Recycle.into());
            }
        }
        if let Some(ttl) = self.settings.database_pool_max_idle {
            if Instant::now() - client.used > Duration::from_millis(ttl as u64) {
                debug!("🏊 Recycle requested (idle).");
                return Err(BigtableError::Recycle.into());
            }
        }
        Ok(())
    }
}

impl BigtableClientManager {
    /// Channels are GRPCIO constructs that contain the actual command data
    /// paths. Channels seem to be fairly light weight.
    pub fn create_channel(&self) -> BigtableResult<ChannelBuilder> {
        debug!("🏊 Creating new channel...");
        let mut chan = ChannelBuilder::new(self.env.clone())
            .max_send_message_len(MAX_MESSAGE_LEN)
            .max_receive_message_len(MAX_MESSAGE_LEN);
        // Don't get the credentials if we are running against the emulator
        if self.dsn.contains("localhost") || std::env::var("BIGTABLE_EMULATOR_HOST").is_ok() {
            debug!("🉑 Using emulator");
        } else {
            chan = chan.set_credentials(
                ChannelCredentials::google_default_credentials()
                    .map_err(|e| BigtableError::Connection(e.to_string()))?,
            );
            debug!("🉑 Using production credentials");
        }
        Ok(chan)
    }
}
