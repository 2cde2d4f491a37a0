use super::transport::{ClusterMetadata, Endpoint, ProduceRequest, ProduceResponse, Session, Transport};
use crate::config::{ProducerConfig, SecuritySettings};
use crate::{Error, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &ProducerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.backoff_jitter,
        )
    }

    /// Delay before retry `attempt` (0 for the first retry). Never exceeds
    /// the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as f64 * 2f64.powi(attempt.min(32) as i32);
        let capped = base.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter) * capped
        } else {
            0.0
        };

        let delay = (capped + jitter).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(delay as u64)
    }
}

struct PooledSession {
    session: Box<dyn Session>,
    authenticated_at: Instant,
}

impl PooledSession {
    fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            authenticated_at: Instant::now(),
        }
    }
}

/// Owns broker sessions: connects, re-authenticates and reconnects.
///
/// A session is checked out by exactly one caller for the duration of a
/// request and returned to the idle pool afterwards. Sessions that saw a
/// transport failure are dropped, never pooled again.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    security: SecuritySettings,
    bootstrap: Vec<Endpoint>,
    backoff: Backoff,
    max_retries: u32,
    request_timeout: Duration,
    reauth_interval: Duration,
    idle: Mutex<HashMap<Endpoint, Vec<PooledSession>>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        security: SecuritySettings,
        bootstrap: Vec<Endpoint>,
        config: &ProducerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            security,
            bootstrap,
            backoff: Backoff::from_config(config),
            max_retries: config.connect_max_retries,
            request_timeout: config.request_timeout(),
            reauth_interval: config.reauth_interval(),
            idle: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Single connection attempt including the TLS/SASL handshake.
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }

        debug!(protocol = self.security.protocol.as_str(), "Connecting to broker");
        match tokio::time::timeout(
            self.request_timeout,
            self.transport.connect(endpoint, &self.security),
        )
        .await
        {
            Ok(Ok(session)) => {
                info!("Connected to broker {}", endpoint);
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Transport(format!(
                "connect to {} timed out after {:?}",
                endpoint, self.request_timeout
            ))),
        }
    }

    /// Sends one batch to `endpoint`, reconnecting with backoff on transport
    /// failures. Broker-level errors are returned as is.
    pub async fn send(&self, endpoint: &Endpoint, request: &ProduceRequest) -> Result<ProduceResponse> {
        let mut failures = 0u32;

        loop {
            let mut pooled = self.checkout(endpoint).await?;

            let result = match tokio::time::timeout(
                self.request_timeout,
                pooled.session.produce(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "produce to {} timed out after {:?}",
                    endpoint, self.request_timeout
                ))),
            };

            match result {
                Err(Error::Transport(reason)) => {
                    failures += 1;
                    if failures > self.max_retries {
                        error!(
                            endpoint = %endpoint,
                            attempts = failures,
                            "Giving up on broker after repeated transport failures"
                        );
                        return Err(Error::ConnectionUnavailable {
                            endpoint: endpoint.to_string(),
                            attempts: failures,
                        });
                    }
                    let delay = self.backoff.delay(failures - 1);
                    warn!(
                        endpoint = %endpoint,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Transport failure, reconnecting: {}",
                        reason
                    );
                    self.sleep(delay).await?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                other => {
                    self.checkin(pooled);
                    return other;
                }
            }
        }
    }

    /// One metadata round-trip, trying bootstrap brokers in order.
    #[instrument(skip(self))]
    pub async fn fetch_metadata(&self, topics: &[String]) -> Result<ClusterMetadata> {
        let mut last_error = None;

        for endpoint in &self.bootstrap {
            let mut pooled = match self.checkout(endpoint).await {
                Ok(pooled) => pooled,
                Err(e) if e.is_fatal() || e == Error::ClientClosed => return Err(e),
                Err(e) => {
                    warn!("Bootstrap broker {} unavailable: {}", endpoint, e);
                    last_error = Some(e);
                    continue;
                }
            };

            match tokio::time::timeout(self.request_timeout, pooled.session.metadata(topics)).await {
                Ok(Ok(metadata)) => {
                    debug!(
                        brokers = metadata.brokers.len(),
                        topics = metadata.topics.len(),
                        "Fetched cluster metadata from {}",
                        endpoint
                    );
                    self.checkin(pooled);
                    return Ok(metadata);
                }
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => {
                    warn!("Metadata request to {} failed: {}", endpoint, e);
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!("Metadata request to {} timed out", endpoint);
                    last_error = Some(Error::Transport(format!(
                        "metadata request to {} timed out",
                        endpoint
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Config("no bootstrap brokers configured".to_string())))
    }

    /// Drops every pooled session and cancels pending backoff sleeps.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        let dropped: usize = self
            .lock_idle()
            .drain()
            .map(|(_, sessions)| sessions.len())
            .sum();
        info!(sessions = dropped, "Connection manager closed");
    }

    async fn checkout(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }

        let idle = self.lock_idle().get_mut(endpoint).and_then(Vec::pop);
        if let Some(mut pooled) = idle {
            if pooled.authenticated_at.elapsed() < self.reauth_interval {
                return Ok(pooled);
            }

            match pooled.session.reauthenticate().await {
                Ok(()) => {
                    debug!("Re-authenticated session to {}", endpoint);
                    pooled.authenticated_at = Instant::now();
                    return Ok(pooled);
                }
                Err(e) => {
                    warn!("Re-authentication to {} failed, reconnecting: {}", endpoint, e);
                }
            }
        }

        self.connect_with_backoff(endpoint).await
    }

    fn checkin(&self, pooled: PooledSession) {
        if self.is_closed() {
            return;
        }
        let endpoint = pooled.session.endpoint().clone();
        self.lock_idle()
            .entry(endpoint)
            .or_default()
            .push(pooled);
    }

    async fn connect_with_backoff(&self, endpoint: &Endpoint) -> Result<PooledSession> {
        let mut failures = 0u32;

        loop {
            match self.connect(endpoint).await {
                Ok(session) => return Ok(PooledSession::new(session)),
                Err(Error::Transport(reason)) => {
                    failures += 1;
                    if failures > self.max_retries {
                        error!(
                            endpoint = %endpoint,
                            attempts = failures,
                            "Broker unreachable: {}",
                            reason
                        );
                        return Err(Error::ConnectionUnavailable {
                            endpoint: endpoint.to_string(),
                            attempts: failures,
                        });
                    }
                    let delay = self.backoff.delay(failures - 1);
                    warn!(
                        endpoint = %endpoint,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed, retrying: {}",
                        reason
                    );
                    self.sleep(delay).await?;
                }
                Err(e) => {
                    error!(endpoint = %endpoint, "Connect failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(Error::ClientClosed);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = shutdown.changed() => Err(Error::ClientClosed),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, Vec<PooledSession>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaslMechanism, SecurityProtocol};
    use crate::kafka::mock::MockTransport;
    use crate::kafka::record::{Record, TopicPartition};

    fn test_config() -> ProducerConfig {
        ProducerConfig {
            connect_max_retries: 3,
            reauth_interval_secs: 60,
            ..Default::default()
        }
    }

    fn manager(mock: &MockTransport, security: SecuritySettings) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(mock.clone()),
            security,
            vec!["broker-0:9092".parse().unwrap()],
            &test_config(),
        )
    }

    fn request() -> ProduceRequest {
        ProduceRequest {
            topic_partition: TopicPartition::new("events", 0),
            sequence: 0,
            records: vec![Record::new("events", "payload")],
            acks: "all".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 0.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 0.2);
        for _ in 0..200 {
            let delay = backoff.delay(2);
            assert!(delay >= Duration::from_millis(320));
            assert!(delay <= Duration::from_millis(480));
        }
        for _ in 0..50 {
            assert!(backoff.delay(30) <= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_reused() {
        let mock = MockTransport::single_broker("events", 1);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        connections.send(&endpoint, &request()).await.unwrap();
        connections.send(&endpoint, &request()).await.unwrap();

        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.produce_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transport_failures() {
        let mock = MockTransport::single_broker("events", 1);
        mock.fail_next_connects(2, Error::Transport("connection refused".to_string()));
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        let response = connections.send(&endpoint, &request()).await.unwrap();
        assert_eq!(response.base_offset, 0);
        assert_eq!(mock.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_transport_failure_discards_session() {
        let mock = MockTransport::single_broker("events", 1);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        connections.send(&endpoint, &request()).await.unwrap();
        mock.fail_next_produce(Error::Transport("broken pipe".to_string()));
        connections.send(&endpoint, &request()).await.unwrap();

        assert_eq!(mock.connect_count(), 2);
        assert_eq!(mock.log("events", 0).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let mock = MockTransport::single_broker("events", 1);
        mock.set_unreachable("broker-0:9092", true);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        let err = connections.send(&endpoint, &request()).await.unwrap_err();
        assert_eq!(
            err,
            Error::ConnectionUnavailable {
                endpoint: "broker-0:9092".to_string(),
                attempts: 4,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_not_retried() {
        let mock = MockTransport::single_broker("events", 1);
        mock.require_credentials("svc", "secret");
        let security = SecuritySettings {
            protocol: SecurityProtocol::SaslPlaintext,
            mechanism: Some(SaslMechanism::ScramSha256),
            username: Some("svc".to_string()),
            password: Some("wrong".to_string()),
        };
        let connections = manager(&mock, security);
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        let err = connections.send(&endpoint, &request()).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sasl_handshake_with_valid_credentials() {
        let mock = MockTransport::single_broker("events", 1);
        mock.require_credentials("svc", "secret");
        let security = SecuritySettings {
            protocol: SecurityProtocol::SaslSsl,
            mechanism: Some(SaslMechanism::Plain),
            username: Some("svc".to_string()),
            password: Some("secret".to_string()),
        };
        let connections = manager(&mock, security);
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        assert!(connections.send(&endpoint, &request()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauthenticates_old_sessions() {
        let mock = MockTransport::single_broker("events", 1);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        connections.send(&endpoint, &request()).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        connections.send(&endpoint, &request()).await.unwrap();

        assert_eq!(mock.reauthentications(), 1);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_manager_rejects_requests() {
        let mock = MockTransport::single_broker("events", 1);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        connections.close();
        assert!(connections.is_closed());
        let err = connections.send(&endpoint, &request()).await.unwrap_err();
        assert_eq!(err, Error::ClientClosed);
        assert_eq!(mock.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_pooled_sessions() {
        let mock = MockTransport::single_broker("events", 1);
        let connections = manager(&mock, SecuritySettings::default());
        let endpoint: Endpoint = "broker-0:9092".parse().unwrap();

        connections.send(&endpoint, &request()).await.unwrap();
        assert_eq!(mock.connect_count(), 1);

        connections.close();
        let err = connections.send(&endpoint, &request()).await.unwrap_err();
        assert_eq!(err, Error::ClientClosed);
        let err = connections
            .fetch_metadata(&["events".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, Error::ClientClosed);
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.log("events", 0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_falls_back_to_next_bootstrap() {
        let mock = MockTransport::new()
            .with_broker(0, "broker-0:9092")
            .with_broker(1, "broker-1:9092")
            .with_topic("events", 2);
        mock.set_unreachable("broker-0:9092", true);

        let connections = ConnectionManager::new(
            Arc::new(mock.clone()),
            SecuritySettings::default(),
            vec![
                "broker-0:9092".parse().unwrap(),
                "broker-1:9092".parse().unwrap(),
            ],
            &test_config(),
        );

        let metadata = connections.fetch_metadata(&["events".to_string()]).await.unwrap();
        assert_eq!(metadata.brokers.len(), 2);
        assert_eq!(metadata.topics["events"].partitions.len(), 2);
    }
}
