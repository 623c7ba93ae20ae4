use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use service::{Identifier, Transport, processor::{Output, Processor}};
use tokio::net::UdpSocket;

use crate::{
    observer::ServerObserver,
    server::{Environment, WorkerEvent},
};

/// A processor for one UDP listening endpoint inside one worker, with
/// its RFC 5780 counterpart advertised when the topology has one.
pub fn make_processor(
    env: &Environment,
    server_id: u8,
    interface: SocketAddr,
) -> Processor<ServerObserver> {
    let mut processor = env
        .service
        .get_processor(server_id, interface, Transport::Udp);

    let alternates = env.router.alternates_of(&interface);
    if let (Some(ip), Some(port)) = (alternates.other_ip, alternates.other_port) {
        processor.set_other_address(Some(SocketAddr::new(ip, port)));
    }

    processor
}

/// udp listener task.
///
/// Reads datagrams and steers each one to its worker by the mixed
/// source port; with zero workers everything is processed inline on
/// this task.
pub async fn listener(
    env: Arc<Environment>,
    socket: Arc<UdpSocket>,
    interface: SocketAddr,
) -> anyhow::Result<()> {
    let mut inline_processor = (env.config.workers() == 0)
        .then(|| make_processor(&env, 0, interface));

    let mut buf = vec![0u8; 4096];

    loop {
        // An error will also be reported when a remote host is shut
        // down; those are not fatal for the listener.
        let (size, source) = match socket.recv_from(&mut buf).await {
            Ok(it) => it,
            Err(e) => {
                if e.kind() != ErrorKind::ConnectionReset {
                    return Err(e.into());
                }

                continue;
            }
        };

        env.statistics.report_received(size);
        log::trace!(
            "udp socket receive: size={}, addr={:?}, interface={:?}",
            size,
            source,
            interface
        );

        // The smallest parseable message is a bare channel data header.
        if size < 4 {
            env.statistics.report_dropped();
            continue;
        }

        match inline_processor.as_mut() {
            Some(processor) => {
                handle(processor, &env, &socket, interface, &buf[..size], source).await;
            }
            None => {
                env.router
                    .dispatch(
                        source.port(),
                        WorkerEvent::Datagram {
                            socket: socket.clone(),
                            data: buf[..size].to_vec(),
                            interface,
                            source,
                        },
                    )
                    .await;
            }
        }
    }
}

/// Run one datagram through the session state machine and carry out
/// whatever it asks for.
pub async fn handle(
    processor: &mut Processor<ServerObserver>,
    env: &Environment,
    socket: &Arc<UdpSocket>,
    interface: SocketAddr,
    data: &[u8],
    source: SocketAddr,
) {
    let id = Identifier {
        transport: Transport::Udp,
        interface,
        source,
    };

    env.router.ensure_udp_sink(id, socket);

    let manager = env.service.get_session_manager();
    manager.report_received(&id, data.len());

    match processor.route(data, source).await {
        Ok(Some(Output::Response(response))) => {
            // CHANGE-REQUEST answers leave from the counterpart socket,
            // RESPONSE-PORT answers go to a different port.
            let out = if response.reply.change_ip || response.reply.change_port {
                env.router.change_endpoint(
                    &interface,
                    response.reply.change_ip,
                    response.reply.change_port,
                )
            } else {
                None
            }
            .unwrap_or_else(|| socket.clone());

            let dest = response
                .reply
                .port
                .map(|port| SocketAddr::new(source.ip(), port))
                .unwrap_or(source);

            match out.send_to(response.bytes, dest).await {
                Ok(_) => {
                    manager.report_sent(&id, response.bytes.len());
                    env.statistics.report_sent(response.bytes.len());

                    log::trace!(
                        "udp socket relay: size={}, addr={:?}",
                        response.bytes.len(),
                        dest
                    );
                }
                Err(e) => {
                    if e.kind() != ErrorKind::ConnectionReset {
                        log::warn!("udp socket send error: {:?}", e);
                    }
                }
            }
        }
        Ok(Some(Output::RelayToPeer { relay, peer, bytes })) => {
            if env.relays.send_to_peer(relay, peer, bytes).await {
                manager.report_sent(&id, bytes.len());
            } else {
                env.statistics.report_dropped();
            }
        }
        Ok(Some(_)) => {
            // Connect and ConnectionBind belong to stream transports.
            log::warn!("stream directive on udp: addr={:?}", source);
        }
        Ok(None) => {
            log::trace!("udp packet consumed: addr={:?}", source);
        }
        Err(e) => {
            env.statistics.report_dropped();
            log::trace!("udp process failed: addr={:?}, {:?}", source, e);
        }
    }
}
