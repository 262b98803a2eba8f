//! Pool matching: pick an idle multiplexer that can serve a request.

use std::sync::Arc;

// ---

use brokerlink_domain::{ConnectionRequestInfo, Credentials, FactoryIdentity};

// ---

use super::ConnectionMultiplexer;

/// Return the first candidate created by an equivalent factory, owned by no
/// user or by the requester, whose request info equals `requested`.
///
/// `None` tells the caller to open a new multiplexer. The requester is the
/// credentials' user, falling back to the user named in `requested`.
pub fn match_multiplexer<'a>(
    candidates: impl IntoIterator<Item = &'a Arc<ConnectionMultiplexer>>,
    factory: &FactoryIdentity,
    requested: &ConnectionRequestInfo,
    credentials: Option<&Credentials>,
) -> Option<Arc<ConnectionMultiplexer>> {
    // ---
    let requester = credentials
        .map(|c| c.user.as_str())
        .or(requested.user.as_deref());

    candidates
        .into_iter()
        .find(|mc| {
            !mc.is_destroyed()
                && mc.user().is_none_or(|owner| Some(owner) == requester)
                && mc.factory_identity() == factory
                && mc.info() == requested
        })
        .cloned()
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
        ConnectionFactoryPtr,
        ConnectionRequestInfo,
        ConnectionType,
        Credentials,
        FactorySettings,
    };
    use brokerlink_sim::{SimBroker, SimConnectionFactory};

    use super::match_multiplexer;
    use crate::ConnectionMultiplexer;

    fn open(broker: &SimBroker, settings: &FactorySettings, info: ConnectionRequestInfo) -> Arc<ConnectionMultiplexer> {
        // ---
        let factory: ConnectionFactoryPtr = Arc::new(SimConnectionFactory::new(broker.clone()));
        ConnectionMultiplexer::open(&factory, Arc::new(settings.clone()), info).unwrap()
    }

    fn request(transacted: bool) -> ConnectionRequestInfo {
        ConnectionRequestInfo::new(transacted, AckMode::Auto, ConnectionType::Agnostic)
    }

    #[test]
    fn matches_equal_request_from_same_factory() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings::default();
        let tx = open(&broker, &settings, request(true));
        let plain = open(&broker, &settings, request(false));
        let pool = vec![tx.clone(), plain.clone()];

        let found = match_multiplexer(&pool, &settings.identity(), &request(false), None).unwrap();
        assert_eq!(found.id(), plain.id());

        let found = match_multiplexer(&pool, &settings.identity(), &request(true), None).unwrap();
        assert_eq!(found.id(), tx.id());
    }

    #[test]
    fn first_match_wins() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings::default();
        let pool = vec![
            open(&broker, &settings, request(false)),
            open(&broker, &settings, request(false)),
        ];
        let found = match_multiplexer(&pool, &settings.identity(), &request(false), None).unwrap();
        assert_eq!(found.id(), pool[0].id());
    }

    #[test]
    fn differing_attributes_do_not_match() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings::default();
        let pool = vec![open(&broker, &settings, request(false))];
        let identity = settings.identity();

        let mut dups_ok = request(false);
        dups_ok.ack_mode = AckMode::DupsOk;
        assert!(match_multiplexer(&pool, &identity, &dups_ok, None).is_none());

        let mut with_client_id = request(false);
        with_client_id.client_id = Some("c1".into());
        assert!(match_multiplexer(&pool, &identity, &with_client_id, None).is_none());

        let other_factory = FactorySettings {
            connection_type: ConnectionType::Queue,
            ..FactorySettings::default()
        };
        assert!(match_multiplexer(&pool, &other_factory.identity(), &request(false), None).is_none());
    }

    #[test]
    fn owned_connection_only_matches_its_user() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings::default();
        let alice = Credentials::new("alice", None);
        let info = request(false).with_credentials(&alice);
        let pool = vec![open(&broker, &settings, info.clone())];
        let identity = settings.identity();

        assert!(match_multiplexer(&pool, &identity, &info, Some(&alice)).is_some());
        assert!(match_multiplexer(&pool, &identity, &info, None).is_some(), "falls back to the request user");
        assert!(match_multiplexer(&pool, &identity, &info, Some(&Credentials::new("bob", None))).is_none());
    }

    #[test]
    fn destroyed_candidates_are_skipped() {
        // ---
        let broker = SimBroker::default();
        let settings = FactorySettings::default();
        let pool = vec![open(&broker, &settings, request(false))];
        pool[0].destroy();
        assert!(match_multiplexer(&pool, &settings.identity(), &request(false), None).is_none());
    }
}
