use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use service::{Credential, Identifier, Observer, RelayKind};

use crate::{
    authenticator::Authenticator, relay::RelayRegistry, server::Router, statistics::Statistics,
};

/// The service's window into the rest of the server: credential
/// lookups go to the auth worker, relay endpoints to the registry, and
/// lifecycle events into the log and the counters.
#[derive(Clone)]
pub struct ServerObserver {
    authenticator: Authenticator,
    relays: Arc<RelayRegistry>,
    router: Arc<Router>,
    statistics: Statistics,
}

impl ServerObserver {
    pub fn new(
        authenticator: Authenticator,
        relays: Arc<RelayRegistry>,
        router: Arc<Router>,
        statistics: Statistics,
    ) -> Self {
        Self {
            authenticator,
            relays,
            router,
            statistics,
        }
    }
}

#[async_trait]
impl Observer for ServerObserver {
    async fn get_credential(&self, username: &str) -> Option<Credential> {
        let credential = self.authenticator.lookup(username).await;
        log::info!(
            "auth: username={:?}, known={}",
            username,
            credential.is_some()
        );

        credential
    }

    async fn relay_bound(&self, id: &Identifier, relay: SocketAddr, kind: RelayKind) -> bool {
        let ok = self.relays.open(relay, kind).await;
        if !ok {
            log::warn!("relay endpoint failed: addr={:?}, relay={:?}", id.source, relay);
        }

        ok
    }

    fn on_allocated(&self, id: &Identifier, username: &str, port: u16) {
        log::info!(
            "allocate: addr={:?}, username={:?}, port={}",
            id.source,
            username,
            port
        );

        self.statistics.allocation_opened();
    }

    fn on_channel_bind(&self, id: &Identifier, username: &str, channel: u16) {
        log::info!(
            "channel bind: addr={:?}, username={:?}, channel=0x{:04x}",
            id.source,
            username,
            channel
        );
    }

    fn on_create_permission(&self, id: &Identifier, username: &str, peers: &[IpAddr]) {
        log::info!(
            "create permission: addr={:?}, username={:?}, peers={:?}",
            id.source,
            username,
            peers
        );
    }

    fn on_refresh(&self, id: &Identifier, username: &str, lifetime: u32) {
        log::info!(
            "refresh: addr={:?}, username={:?}, lifetime={}",
            id.source,
            username,
            lifetime
        );
    }

    fn on_connect(&self, id: &Identifier, username: &str, connection: u32) {
        log::info!(
            "connect: addr={:?}, username={:?}, connection={}",
            id.source,
            username,
            connection
        );
    }

    fn on_connection_bind(&self, id: &Identifier, username: &str, connection: u32) {
        log::info!(
            "connection bind: addr={:?}, username={:?}, connection={}",
            id.source,
            username,
            connection
        );
    }

    fn on_destroy(&self, id: &Identifier, username: &str, relay: Option<SocketAddr>) {
        log::info!("session destroy: addr={:?}, username={:?}", id.source, username);

        if let Some(relay) = relay {
            self.relays.close(&relay);
            self.statistics.allocation_closed();
        }

        self.router.remove_sink(id);
    }
}
