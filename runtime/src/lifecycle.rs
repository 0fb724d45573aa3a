//! Process-level service lifecycle.
//!
//! An [`AppEnv`] owns the long-lived services of a process (the channel
//! service, database pools, ...). [`AppEnv::init`] starts them in
//! registration order, retrying transient failures with backoff;
//! [`AppEnv::close`] stops them in reverse order and keeps going past
//! failures so every service gets a chance to release its resources.
//!
//! # Example
//!
//! ```ignore
//! let mut env = AppEnv::new().with_init_policy(BackoffPolicy::default());
//! env.add_service(Arc::new(channel_service.clone()));
//!
//! env.init().await?;
//! // ... run ...
//! env.close().await?;
//! ```

use crate::ChannelService;
use crate::backoff::{BackoffPolicy, retry_with_predicate};
use courier_core::ChannelError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by service hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by service hooks.
pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

/// A long-lived service with explicit startup and shutdown.
///
/// Methods return boxed futures so services can be stored as
/// `Arc<dyn AppService>`.
pub trait AppService: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Prepare the service for use.
    fn init(&self) -> LifecycleFuture<'_>;

    /// Release the service's resources.
    fn close(&self) -> LifecycleFuture<'_>;

    /// Whether a failed [`init`](Self::init) is worth retrying.
    fn is_retryable(&self, _error: &BoxError) -> bool {
        true
    }
}

/// Errors from starting or stopping services.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A service failed to start.
    #[error("failed to initialize service \"{service}\": {source}")]
    Init {
        /// Name of the service
        service: String,
        /// The last init error
        #[source]
        source: BoxError,
    },

    /// One or more services failed to close.
    #[error("failed to close services: {}", .services.join(", "))]
    Close {
        /// Names of the services whose close failed
        services: Vec<String>,
    },
}

/// The set of services a process runs.
pub struct AppEnv {
    services: Vec<Arc<dyn AppService>>,
    init_policy: BackoffPolicy,
}

impl Default for AppEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AppEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppEnv")
            .field(
                "services",
                &self.services.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("init_policy", &self.init_policy)
            .finish()
    }
}

impl AppEnv {
    /// An empty environment with the default init backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            init_policy: BackoffPolicy::default(),
        }
    }

    /// Use `policy` when a service fails to initialize.
    #[must_use]
    pub fn with_init_policy(mut self, policy: BackoffPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    /// Register a service. Services start in registration order.
    pub fn add_service(&mut self, service: Arc<dyn AppService>) {
        self.services.push(service);
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Initialize every service in registration order.
    ///
    /// Each service is retried according to the init policy while its
    /// errors are retryable. Stops at the first service that cannot start.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Init`] naming the service that failed.
    pub async fn init(&self) -> Result<(), LifecycleError> {
        for service in &self.services {
            tracing::info!(service = service.name(), "Initializing service");

            retry_with_predicate(
                self.init_policy.clone(),
                service.name(),
                || service.init(),
                |error| service.is_retryable(error),
            )
            .await
            .map_err(|source| LifecycleError::Init {
                service: service.name().to_string(),
                source,
            })?;

            tracing::info!(service = service.name(), "Service initialized");
        }
        Ok(())
    }

    /// Close every service in reverse registration order.
    ///
    /// A failing service does not stop the others from closing.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Close`] naming every service whose close
    /// failed.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let mut failed = Vec::new();

        for service in self.services.iter().rev() {
            match service.close().await {
                Ok(()) => tracing::info!(service = service.name(), "Service closed"),
                Err(error) => {
                    tracing::error!(service = service.name(), error = %error, "Service failed to close");
                    failed.push(service.name().to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Close { services: failed })
        }
    }
}

impl AppService for ChannelService {
    fn name(&self) -> &str {
        "channel-service"
    }

    /// Reconciles topology for every registered channel.
    fn init(&self) -> LifecycleFuture<'_> {
        Box::pin(async move { self.reconcile_all().await.map_err(BoxError::from) })
    }

    fn close(&self) -> LifecycleFuture<'_> {
        Box::pin(async move { ChannelService::close(self).await.map_err(BoxError::from) })
    }

    fn is_retryable(&self, error: &BoxError) -> bool {
        error
            .downcast_ref::<ChannelError>()
            .is_none_or(|error| !error.is_configuration() && !error.is_closed())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        init_failures: AtomicUsize,
        fail_close: bool,
    }

    impl Recording {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                init_failures: AtomicUsize::new(0),
                fail_close: false,
            }
        }

        fn record(&self, event: &str) {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}:{event}", self.name));
        }
    }

    impl AppService for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn init(&self) -> LifecycleFuture<'_> {
            Box::pin(async move {
                self.record("init");
                let remaining = self.init_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.init_failures.store(remaining - 1, Ordering::SeqCst);
                    return Err("broker not ready".into());
                }
                Ok(())
            })
        }

        fn close(&self) -> LifecycleFuture<'_> {
            Box::pin(async move {
                self.record("close");
                if self.fail_close {
                    return Err("close failed".into());
                }
                Ok(())
            })
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    #[tokio::test]
    async fn init_in_order_close_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut env = AppEnv::new();
        env.add_service(Arc::new(Recording::new("db", &log)));
        env.add_service(Arc::new(Recording::new("channels", &log)));

        env.init().await.expect("init");
        env.close().await.expect("close");

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["db:init", "channels:init", "channels:close", "db:close"]
        );
    }

    #[tokio::test]
    async fn init_retries_transient_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = Recording::new("channels", &log);
        service.init_failures.store(2, Ordering::SeqCst);

        let mut env = AppEnv::new().with_init_policy(fast_policy());
        env.add_service(Arc::new(service));

        env.init().await.expect("init after retries");
        assert_eq!(log.lock().expect("log lock").len(), 3);
    }

    #[tokio::test]
    async fn init_gives_up_after_policy_is_exhausted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = Recording::new("channels", &log);
        service.init_failures.store(10, Ordering::SeqCst);

        let mut env = AppEnv::new().with_init_policy(fast_policy());
        env.add_service(Arc::new(service));

        let result = env.init().await;
        assert!(matches!(result, Err(LifecycleError::Init { service, .. }) if service == "channels"));
        assert_eq!(log.lock().expect("log lock").len(), 4);
    }

    #[tokio::test]
    async fn init_without_retries_fails_on_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = Recording::new("channels", &log);
        service.init_failures.store(1, Ordering::SeqCst);

        let mut env = AppEnv::new().with_init_policy(BackoffPolicy::no_retry());
        env.add_service(Arc::new(service));

        assert!(matches!(env.init().await, Err(LifecycleError::Init { .. })));
        assert_eq!(*log.lock().expect("log lock"), vec!["channels:init"]);
    }

    #[tokio::test]
    async fn close_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recording::new("cache", &log);
        failing.fail_close = true;

        let mut env = AppEnv::new();
        env.add_service(Arc::new(Recording::new("db", &log)));
        env.add_service(Arc::new(failing));

        let result = env.close().await;

        assert!(matches!(result, Err(LifecycleError::Close { services }) if services == vec!["cache"]));
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["cache:close", "db:close"]
        );
    }

    #[test]
    fn channel_configuration_errors_are_not_retryable() {
        let service = ChannelService::builder().build(courier_testing::InMemoryTransport::new());

        let config: BoxError = Box::new(ChannelError::NoDeadLetterChannel);
        let closed: BoxError = Box::new(ChannelError::Closed);
        let other: BoxError = "connection refused".into();

        assert!(!AppService::is_retryable(&service, &config));
        assert!(!AppService::is_retryable(&service, &closed));
        assert!(AppService::is_retryable(&service, &other));
    }
}
