use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use codec::Decoder;
use service::{Identifier, Transport, processor::Output};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};

use crate::server::{Environment, WorkerEvent};

/// tcp listener task.
///
/// Accepts client connections and hands each socket off whole to the
/// worker its source port steers to; with zero workers the connection
/// task starts right here.
pub async fn listener(env: Arc<Environment>, listener: TcpListener, interface: SocketAddr) {
    let single = env.config.workers() == 0;

    while let Ok((stream, source)) = listener.accept().await {
        log::info!(
            "tcp socket accept: addr={:?}, interface={:?}",
            source,
            interface
        );

        if single {
            tokio::spawn(handle(env.clone(), 0, stream, interface, source, Transport::Tcp));
        } else {
            env.router
                .dispatch(
                    source.port(),
                    WorkerEvent::Socket {
                        stream,
                        interface,
                        source,
                    },
                )
                .await;
        }
    }
}

/// One stream-transport client connection.
///
/// Messages are reassembled by the framing rules (stun length header,
/// channel data padded to 4 over stream transports) and run through a
/// connection-local processor. A successful ConnectionBind promotes the
/// socket into a raw pipe spliced with the peer leg; everything after
/// the promotion is payload, not protocol.
pub async fn handle<S>(
    env: Arc<Environment>,
    server_id: u8,
    stream: S,
    interface: SocketAddr,
    source: SocketAddr,
    transport: Transport,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = Identifier {
        interface,
        transport,
        source,
    };

    let mut processor = env.service.get_processor(server_id, interface, transport);
    let manager = env.service.get_session_manager().clone();

    let (mut reader, mut writer) = tokio::io::split(stream);

    // The write half serialises everything addressed to this client:
    // responses, indications arriving from relay tasks, and after a
    // promotion the peer's byte stream.
    let (sender, mut outbound) = mpsc::channel::<Vec<u8>>(32);
    env.router.register_tcp_sink(id, sender.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(8192);
    let mut promoted = None;

    'stream: loop {
        while promoted.is_none() && buf.len() >= 4 {
            let size = match Decoder::message_size(&buf, true) {
                Ok(it) => it,
                Err(_) => break 'stream,
            };

            if buf.len() < size {
                break;
            }

            let frame = buf.split_to(size);
            env.statistics.report_received(frame.len());
            manager.report_received(&id, frame.len());

            match processor.route(&frame, source).await {
                Ok(Some(Output::Response(response))) => {
                    if sender.send(response.bytes.to_vec()).await.is_err() {
                        break 'stream;
                    }

                    env.statistics.report_sent(response.bytes.len());
                    manager.report_sent(&id, response.bytes.len());
                }
                Ok(Some(Output::RelayToPeer { relay, peer, bytes })) => {
                    if env.relays.send_to_peer(relay, peer, bytes).await {
                        manager.report_sent(&id, bytes.len());
                    }
                }
                Ok(Some(Output::ConnectPeer { connection, peer })) => {
                    if let Some((relay, _)) = manager.relay_of(&id) {
                        env.relays.connect(id, connection, peer, relay);
                    }
                }
                Ok(Some(Output::Promote { bytes, connection, .. })) => {
                    if sender.send(bytes.to_vec()).await.is_err() {
                        break 'stream;
                    }

                    promoted = Some(connection);
                }
                Ok(None) => {}
                Err(e) => {
                    log::trace!("tcp process failed: addr={:?}, {:?}", source, e);
                }
            }
        }

        if promoted.is_some() {
            break;
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    if let Some(connection) = promoted {
        if let Some(peer_stream) = env.relays.take_peer(connection) {
            splice(&env, id, connection, reader, buf, sender, peer_stream).await;
        } else {
            log::warn!("promoted without a peer leg: connection={}", connection);
        }
    }

    log::info!("tcp socket disconnect: addr={:?}", source);

    env.router.remove_sink(&id);
    manager.remove_sessions(&[id]);
    writer_task.abort();
}

/// The post-bind data phase of RFC 6062: bytes stream verbatim between
/// the client data connection and the peer connection, in both
/// directions, until either side closes.
async fn splice<R>(
    env: &Arc<Environment>,
    id: Identifier,
    connection: u32,
    mut client: R,
    unsent: BytesMut,
    sender: mpsc::Sender<Vec<u8>>,
    peer: tokio::net::TcpStream,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let manager = env.service.get_session_manager().clone();
    let (mut peer_reader, mut peer_writer) = tokio::io::split(peer);

    // Peer-to-client goes through the client's outbound queue.
    let inbound = tokio::spawn(async move {
        let mut chunk = vec![0u8; 4096];

        loop {
            match peer_reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(chunk[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Bytes that arrived on the client socket before the promotion
    // belong to the peer already.
    if !unsent.is_empty() && peer_writer.write_all(&unsent).await.is_err() {
        inbound.abort();
        manager.tcp_connection_closed(connection);
        return;
    }

    let mut chunk = vec![0u8; 4096];
    loop {
        match client.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                manager.report_received(&id, n);

                if peer_writer.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }

    inbound.abort();
    manager.tcp_connection_closed(connection);
}
