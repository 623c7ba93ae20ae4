pub mod router;
pub mod tcp;
#[cfg(feature = "ssl")]
pub mod tls;
pub mod udp;

pub use router::{Alternates, Router, WorkerEvent, mix32, worker_loop};

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use service::{Service, ServiceOptions};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Barrier, mpsc};

use crate::{
    authenticator::Authenticator, config::Config, observer::ServerObserver, relay::RelayRegistry,
    statistics::Statistics,
};

/// Everything a listener or worker task needs, bundled once at startup
/// and shared immutably; the mutable parts carry their own locks.
pub struct Environment {
    pub config: Arc<Config>,
    pub service: Service<ServerObserver>,
    pub router: Arc<Router>,
    pub relays: Arc<RelayRegistry>,
    pub statistics: Statistics,
}

/// Start everything: the auth worker, the relay workers behind the
/// startup barrier, then the listeners, and run until interrupted.
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let pidfile = write_pidfile(&config.pidfile)?;
    let _environment = startup(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");

    if let Some(pidfile) = pidfile {
        let _ = fs::remove_file(pidfile);
    }

    Ok(())
}

/// Bring the whole server up and return once every listener is bound.
/// Split out of [`run`] so integration tests can drive a live server
/// without the signal wait.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<Arc<Environment>> {
    let workers = config.workers();

    let statistics = Statistics::default();
    let router = Arc::new(Router::new(workers));
    let relays = RelayRegistry::new(router.clone(), statistics.clone());

    let authenticator = Authenticator::spawn(config.static_users(), config.userdb.as_deref())?;
    let observer = ServerObserver::new(
        authenticator,
        relays.clone(),
        router.clone(),
        statistics.clone(),
    );

    let service = Service::new(ServiceOptions {
        config: config.service_config()?,
        handler: observer,
    });

    relays.set_service(service.clone());

    let environment = Arc::new(Environment {
        config: config.clone(),
        service,
        router: router.clone(),
        relays,
        statistics: statistics.clone(),
    });

    // All workers must reach the rendezvous before the listeners start
    // dispatching, so a socket is never handed to a worker without
    // tables.
    let barrier = Arc::new(Barrier::new(workers + 1));
    let mut queues = Vec::with_capacity(workers);
    for index in 0..workers {
        let (sender, receiver) = mpsc::channel(1024);
        queues.push(sender);

        tokio::spawn(worker_loop(
            index as u8,
            receiver,
            environment.clone(),
            barrier.clone(),
        ));
    }

    router.set_workers(queues);
    barrier.wait().await;

    start_listeners(&environment).await?;
    tokio::spawn(statistics.run_reporter());

    log::info!("turn relay workers number: {}", workers);
    log::info!(
        "turn relay listening: port={}, tls port={}, realm={:?}",
        config.listening_port,
        config.tls_listening_port,
        config.realm
    );

    Ok(environment)
}

async fn start_listeners(environment: &Arc<Environment>) -> anyhow::Result<()> {
    let config = &environment.config;
    let ips = config.listening_ips();

    if !config.no_udp {
        for (index, ip) in ips.iter().enumerate() {
            // The RFC 5780 CHANGE-REQUEST counterpart: the next
            // configured address, when there is more than one.
            let other_ip = (ips.len() > 1).then(|| ips[(index + 1) % ips.len()]);

            for (port, other_port) in [
                (config.listening_port, config.alt_port()),
                (config.alt_port(), config.listening_port),
            ] {
                let interface = SocketAddr::new(*ip, port);
                let socket = Arc::new(
                    UdpSocket::bind(interface)
                        .await
                        .with_context(|| format!("udp bind failed: {:?}", interface))?,
                );

                environment.router.register_endpoint(
                    interface,
                    socket.clone(),
                    Alternates {
                        other_port: Some(other_port),
                        other_ip,
                    },
                );

                tokio::spawn(udp::listener(environment.clone(), socket, interface));
            }
        }

        // Auxiliary endpoints: plain STUN/TURN, no alternates.
        for interface in &config.aux_servers {
            let socket = Arc::new(
                UdpSocket::bind(interface)
                    .await
                    .with_context(|| format!("udp bind failed: {:?}", interface))?,
            );

            environment
                .router
                .register_endpoint(*interface, socket.clone(), Alternates::default());

            tokio::spawn(udp::listener(environment.clone(), socket, *interface));
        }
    }

    if !config.no_tcp {
        for ip in &ips {
            let interface = SocketAddr::new(*ip, config.listening_port);
            let listener = TcpListener::bind(interface)
                .await
                .with_context(|| format!("tcp bind failed: {:?}", interface))?;

            tokio::spawn(tcp::listener(environment.clone(), listener, interface));
        }

        for interface in &config.aux_servers {
            let listener = TcpListener::bind(interface)
                .await
                .with_context(|| format!("tcp bind failed: {:?}", interface))?;

            tokio::spawn(tcp::listener(environment.clone(), listener, *interface));
        }
    }

    #[cfg(feature = "ssl")]
    if !config.no_tls {
        if let (Some(cert), Some(pkey)) = (&config.cert, &config.pkey) {
            let acceptor = tls::make_acceptor(cert, pkey)?;

            for ip in &ips {
                let interface = SocketAddr::new(*ip, config.tls_listening_port);
                let listener = TcpListener::bind(interface)
                    .await
                    .with_context(|| format!("tls bind failed: {:?}", interface))?;

                tokio::spawn(tls::listener(
                    environment.clone(),
                    acceptor.clone(),
                    listener,
                    interface,
                ));
            }
        }
    }

    if !config.no_dtls {
        // The DTLS listener rides on the crypto library wiring, which
        // is not carried here.
        log::warn!("dtls listeners are not available in this build");
    }

    Ok(())
}

/// Write the PID file, falling back through the usual paths when the
/// configured one is not writable. Failing all of them is not fatal.
fn write_pidfile(configured: &PathBuf) -> anyhow::Result<Option<PathBuf>> {
    let pid = std::process::id().to_string();

    let fallbacks = [
        configured.clone(),
        PathBuf::from("/var/tmp/turnserver.pid"),
        PathBuf::from("/tmp/turnserver.pid"),
    ];

    for path in fallbacks {
        if fs::write(&path, &pid).is_ok() {
            log::info!("pid file: {:?}", path);
            return Ok(Some(path));
        }
    }

    log::warn!("pid file could not be written: {:?}", configured);

    // An unwritable pid file is only fatal when it was explicitly
    // requested somewhere unusual.
    if configured != &PathBuf::from("/var/run/turnserver.pid") {
        return Err(anyhow!("pid file could not be written: {:?}", configured));
    }

    Ok(None)
}
