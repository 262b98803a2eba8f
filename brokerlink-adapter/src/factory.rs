//! [`ManagedConnectionFactory`] — creates and matches multiplexers for one
//! configured broker connection factory.

use std::sync::Arc;

// ---

use parking_lot::Mutex;
use uuid::Uuid;

// ---

use brokerlink_domain::{
    // ---
    ConnectionFactoryPtr,
    ConnectionRequestInfo,
    Credentials,
    DirectoryPtr,
    FactorySettings,
    Result,
};

// ---

use super::{match_multiplexer, ConnectionMultiplexer, SessionHandle};

/// Outcome of [`ManagedConnectionFactory::allocate`].
pub struct Allocation {
    // ---
    pub multiplexer: Arc<ConnectionMultiplexer>,
    pub handle: SessionHandle,

    /// `false` when an idle multiplexer was reused.
    pub created: bool,
}

pub struct ManagedConnectionFactory {
    // ---
    id: Uuid,
    settings: Arc<FactorySettings>,
    directory: DirectoryPtr,

    /// Resolved on first use, then reused.
    resolved: Mutex<Option<ConnectionFactoryPtr>>,
}

// ---

impl ManagedConnectionFactory {
    // ---
    pub fn new(settings: FactorySettings, directory: DirectoryPtr) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            settings: Arc::new(settings),
            directory,
            resolved: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &FactorySettings {
        &self.settings
    }

    /// The broker client factory named in the settings.
    pub fn connection_factory(&self) -> Result<ConnectionFactoryPtr> {
        // ---
        let mut resolved = self.resolved.lock();
        if let Some(factory) = resolved.as_ref() {
            return Ok(factory.clone());
        }
        let factory = self
            .directory
            .lookup_connection_factory(&self.settings.connection_factory, &self.settings.directory_parameters)?;
        tracing::debug!(mcf = %self.id, name = %self.settings.connection_factory, "connection factory resolved");
        *resolved = Some(factory.clone());
        Ok(factory)
    }

    /// Complete a request with the factory defaults and the caller's
    /// credentials.
    pub fn request_info(
        &self,
        info: Option<&ConnectionRequestInfo>,
        credentials: Option<&Credentials>,
    ) -> ConnectionRequestInfo {
        // ---
        let info = info
            .cloned()
            .unwrap_or_else(|| ConnectionRequestInfo::from_settings(&self.settings));
        let info = match credentials {
            Some(c) => info.with_credentials(c),
            None => info,
        };
        info.with_defaults(&self.settings)
    }

    pub fn create_multiplexer(
        &self,
        info: Option<&ConnectionRequestInfo>,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<ConnectionMultiplexer>> {
        // ---
        let info = self.request_info(info, credentials);
        let factory = self.connection_factory()?;
        ConnectionMultiplexer::open(&factory, self.settings.clone(), info)
    }

    pub fn match_multiplexer<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Arc<ConnectionMultiplexer>>,
        info: Option<&ConnectionRequestInfo>,
        credentials: Option<&Credentials>,
    ) -> Option<Arc<ConnectionMultiplexer>> {
        // ---
        let requested = self.request_info(info, credentials);
        match_multiplexer(candidates, &self.settings.identity(), &requested, credentials)
    }

    /// Reuse a matching idle multiplexer or open a new one, then hand out a
    /// handle on it.
    pub fn allocate(
        &self,
        idle: &[Arc<ConnectionMultiplexer>],
        info: Option<&ConnectionRequestInfo>,
        credentials: Option<&Credentials>,
    ) -> Result<Allocation> {
        // ---
        let (multiplexer, created) = match self.match_multiplexer(idle, info, credentials) {
            Some(mc) => (mc, false),
            None => (self.create_multiplexer(info, credentials)?, true),
        };
        let requested = self.request_info(info, credentials);
        let handle = multiplexer.get_connection(credentials, Some(&requested))?;
        tracing::debug!(mcf = %self.id, mc = %multiplexer.id(), created, "handle allocated");
        Ok(Allocation {
            multiplexer,
            handle,
            created,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use brokerlink_domain::{
        // ---
        AckMode,
        BrokerError,
        ConnectionRequestInfo,
        ConnectionType,
        Credentials,
        FactorySettings,
    };
    use brokerlink_sim::{SimBroker, SimConfig, SimDirectory};

    use super::ManagedConnectionFactory;

    const CF: &str = "java:/ConnectionFactory";

    fn factory(broker: &SimBroker, settings: FactorySettings) -> ManagedConnectionFactory {
        // ---
        let settings = FactorySettings {
            connection_factory: CF.into(),
            ..settings
        };
        ManagedConnectionFactory::new(settings, Arc::new(SimDirectory::with_broker(CF, broker)))
    }

    #[test]
    fn allocate_reuses_matching_idle_multiplexer() {
        // ---
        let broker = SimBroker::default();
        let mcf = factory(&broker, FactorySettings::default());
        let info = ConnectionRequestInfo::new(false, AckMode::Auto, ConnectionType::Agnostic);

        let first = mcf.allocate(&[], Some(&info), None).unwrap();
        assert!(first.created);
        first.handle.close();

        let idle = vec![first.multiplexer.clone()];
        let second = mcf.allocate(&idle, Some(&info), None).unwrap();
        assert!(!second.created);
        assert_eq!(second.multiplexer.id(), first.multiplexer.id());
        assert_eq!(broker.connect_attempt_count(), 1);

        let tx = ConnectionRequestInfo::new(true, AckMode::Auto, ConnectionType::Agnostic);
        let third = mcf.allocate(&idle, Some(&tx), None).unwrap();
        assert!(third.created);
    }

    #[test]
    fn defaults_fill_request_credentials_and_client_id() {
        // ---
        let broker = SimBroker::default();
        let mcf = factory(
            &broker,
            FactorySettings {
                user: Some("svc".into()),
                client_id: Some("app-1".into()),
                ..FactorySettings::default()
            },
        );
        let info = mcf.request_info(None, None);
        assert_eq!(info.user.as_deref(), Some("svc"));
        assert_eq!(info.client_id.as_deref(), Some("app-1"));
        assert!(info.transacted);

        let explicit = mcf.request_info(None, Some(&Credentials::new("alice", Some("pw".into()))));
        assert_eq!(explicit.user.as_deref(), Some("alice"));
    }

    #[test]
    fn unknown_factory_name_fails_creation() {
        // ---
        let broker = SimBroker::default();
        let mcf = ManagedConnectionFactory::new(
            FactorySettings {
                connection_factory: "missing".into(),
                ..FactorySettings::default()
            },
            Arc::new(SimDirectory::with_broker(CF, &broker)),
        );
        assert!(mcf.create_multiplexer(None, None).is_err());
        assert_eq!(broker.connect_attempt_count(), 0);
    }

    #[test]
    fn authentication_failure_is_a_setup_error() {
        // ---
        let broker = SimBroker::new(SimConfig::capable().with_users([("alice", Some("secret"))]));
        let mcf = factory(&broker, FactorySettings::default());

        let good = Credentials::new("alice", Some("secret".into()));
        assert!(mcf.create_multiplexer(None, Some(&good)).is_ok());

        let bad = Credentials::new("alice", Some("wrong".into()));
        let err = mcf.create_multiplexer(None, Some(&bad)).unwrap_err();
        assert!(matches!(err, BrokerError::Setup(_)), "got {err}");
    }
}
