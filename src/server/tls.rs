use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use service::Transport;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};

use crate::server::Environment;

/// Build the TLS acceptor from the PEM certificate and key files.
pub fn make_acceptor(cert: &Path, pkey: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert).with_context(|| format!("read certificate failed: {:?}", cert))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse certificate failed")?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(pkey).with_context(|| format!("read private key failed: {:?}", pkey))?,
    ))
    .context("parse private key failed")?
    .ok_or_else(|| anyhow!("no private key in {:?}", pkey))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// tls listener task.
///
/// The handshake runs on its own task so a stalling client cannot block
/// the accept loop; the established stream then behaves exactly like a
/// TCP one, with the session keyed as TLS.
pub async fn listener(
    env: Arc<Environment>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    interface: SocketAddr,
) {
    while let Ok((stream, source)) = listener.accept().await {
        log::info!(
            "tls socket accept: addr={:?}, interface={:?}",
            source,
            interface
        );

        let env = env.clone();
        let acceptor = acceptor.clone();
        let server_id = env.router.worker_for(source.port()) as u8;

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(stream) => {
                    crate::server::tcp::handle(
                        env,
                        server_id,
                        stream,
                        interface,
                        source,
                        Transport::Tls,
                    )
                    .await;
                }
                Err(e) => {
                    log::info!("tls handshake failed: addr={:?}, {}", source, e);
                }
            }
        });
    }
}
