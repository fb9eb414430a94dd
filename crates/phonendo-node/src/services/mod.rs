//! Reference role services and the per-role wiring of a node.

pub mod load;
pub mod manager;
pub mod publisher;
pub mod reader;
pub mod storage;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;

use phonendo_mesh::{
    identify_handler, DiscoveryNegotiator, Dispatcher, Orchestrator, RoleClient, RoleRegistry,
};
use phonendo_network::PeerTransport;
use phonendo_protocol::{Protocol, Role};

use crate::config::NodeConfig;

pub use manager::ManagerService;
pub use publisher::{Ledger, LedgerEntry};
pub use reader::ReaderService;
pub use storage::{RecordCache, StorageError};
pub use verifier::VerifierService;

/// Capture interval of a reader with no configured interval.
pub const DEFAULT_READER_INTERVAL: Duration = Duration::from_secs(5);

/// Protocols a node of `role` answers, in canonical order.
pub fn served_protocols(role: Role) -> Vec<Protocol> {
    match role {
        Role::Manager => vec![Protocol::Discover, Protocol::Capture],
        Role::Storage => vec![
            Protocol::Discover,
            Protocol::Capture,
            Protocol::Verify,
            Protocol::Publish,
            Protocol::Reconnect,
            Protocol::Cache,
        ],
        Role::Verifier => vec![Protocol::Discover, Protocol::Verify, Protocol::Pk],
        Role::Publisher => vec![Protocol::Discover, Protocol::Publish],
        Role::Reader => vec![Protocol::Discover],
    }
}

/// Role-specific state kept alive by a running node.
#[derive(Clone)]
pub enum RoleService {
    Manager(ManagerService),
    Storage(RecordCache),
    Verifier(VerifierService),
    Publisher(Ledger),
    Reader(ReaderService),
}

/// Everything a node needs to run, independent of the transport behind it.
pub struct Assembly {
    pub role: Role,
    pub registry: RoleRegistry,
    pub negotiator: DiscoveryNegotiator,
    pub dispatcher: Dispatcher,
    pub service: RoleService,
}

/// Build the registry, negotiator, dispatcher and service for `config`'s
/// role on top of `transport`.
pub async fn assemble(
    config: &NodeConfig,
    transport: Arc<dyn PeerTransport>,
) -> Result<Assembly, anyhow::Error> {
    let role = config.node.role;
    let registry = RoleRegistry::new(transport.clone());
    let client = RoleClient::new(registry.clone(), transport).with_timeout(config.request_timeout());

    let negotiator = DiscoveryNegotiator::builder();
    let dispatcher = Dispatcher::builder().route(Protocol::Discover, identify_handler(role));

    let (negotiator, dispatcher, service) = match role {
        Role::Manager => {
            let orchestrator = Orchestrator::new(client.clone(), config.replay_policy());
            let service = ManagerService::new(orchestrator, config.synthetic_load_interval());
            (
                service.negotiator(negotiator),
                service.routes(dispatcher),
                RoleService::Manager(service),
            )
        }
        Role::Storage => {
            let cache = RecordCache::open(&config.storage.cache_path).await?;
            (
                negotiator,
                storage::routes(dispatcher, cache.clone()),
                RoleService::Storage(cache),
            )
        }
        Role::Verifier => {
            let service =
                VerifierService::load_or_generate(config.verifier.key_path.as_deref()).await?;
            (
                negotiator,
                verifier::routes(dispatcher, service.clone()),
                RoleService::Verifier(service),
            )
        }
        Role::Publisher => {
            let ledger = Ledger::new();
            (
                negotiator,
                publisher::routes(dispatcher, ledger.clone()),
                RoleService::Publisher(ledger),
            )
        }
        Role::Reader => {
            let interval = config
                .synthetic_load_interval()
                .unwrap_or(DEFAULT_READER_INTERVAL);
            let service = ReaderService::new(client.clone(), interval);
            (
                service.negotiator(negotiator),
                dispatcher,
                RoleService::Reader(service),
            )
        }
    };

    Ok(Assembly {
        role,
        registry: registry.clone(),
        negotiator: negotiator.build(registry, client)?,
        dispatcher: dispatcher.build()?,
        service,
    })
}
