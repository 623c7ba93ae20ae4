use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, anyhow};
use clap::Parser;
use service::{
    ServiceConfig, ServiceFlags,
    auth::{Credentials, IpPattern, PeerPolicy},
    session::ports::PortRange,
};

/// A static account of the `-u user:password` form.
#[derive(Debug, Clone)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    args_override_self = true,
)]
pub struct Config {
    /// TURN listener port for UDP and TCP.
    #[arg(short = 'p', long, default_value_t = 3478)]
    pub listening_port: u16,

    /// TURN listener port for TLS listeners.
    #[arg(long, default_value_t = 5349)]
    pub tls_listening_port: u16,

    /// Alternative listening port for the STUN CHANGE-REQUEST behaviour
    /// (RFC 5780). Defaults to the listening port plus one.
    #[arg(long)]
    pub alt_listening_port: Option<u16>,

    /// Alternative listening port for TLS. Defaults to the TLS port
    /// plus one.
    #[arg(long)]
    pub alt_tls_listening_port: Option<u16>,

    /// Lower bound of the UDP relay port range.
    #[arg(long, default_value_t = 49152)]
    pub min_port: u16,

    /// Upper bound of the UDP relay port range.
    #[arg(long, default_value_t = 65535)]
    pub max_port: u16,

    /// Listener IP address. May be given several times.
    #[arg(short = 'L', long = "listening-ip")]
    pub listening_ips: Vec<IpAddr>,

    /// Relay address: the local IP relay sockets bind on. May be given
    /// several times, one per address family is used.
    #[arg(short = 'E', long = "relay-ip")]
    pub relay_ips: Vec<IpAddr>,

    /// Public/private address mapping in the form `public-ip` or
    /// `public-ip/private-ip`, when the server sits behind NAT.
    #[arg(short = 'X', long = "external-ip")]
    pub external_ips: Vec<String>,

    /// Auxiliary STUN/TURN endpoint, `ip:port`. Auxiliary servers have
    /// no alternative ports and no CHANGE-REQUEST support.
    #[arg(long = "aux-server")]
    pub aux_servers: Vec<SocketAddr>,

    /// Number of relay worker threads. Zero collapses everything into
    /// the listener. Defaults to the CPU count, capped at 128.
    #[arg(short = 'm', long)]
    pub relay_threads: Option<usize>,

    /// Use the long-term credential mechanism.
    #[arg(short = 'a', long)]
    pub lt_cred_mech: bool,

    /// Use the short-term credential mechanism.
    #[arg(short = 'A', long)]
    pub st_cred_mech: bool,

    /// Do not use any credential mechanism, allow anonymous access.
    #[arg(short = 'z', long)]
    pub no_auth: bool,

    /// Static user account, in the form `username:password`. May be
    /// given several times.
    #[arg(short = 'u', long = "user")]
    pub users: Vec<String>,

    /// The authentication realm.
    #[arg(short = 'r', long, default_value = "localhost")]
    pub realm: String,

    /// Per-user concurrent allocation quota, 0 for no limit.
    #[arg(short = 'q', long, default_value_t = 0)]
    pub user_quota: usize,

    /// Total concurrent allocation quota, 0 for no limit.
    #[arg(short = 'Q', long, default_value_t = 0)]
    pub total_quota: usize,

    /// TURN REST API: authenticate with timed usernames against shared
    /// secrets instead of provisioned accounts.
    #[arg(long)]
    pub use_auth_secret: bool,

    /// Shared secret for the TURN REST API. May be given several times;
    /// any matching secret accepts.
    #[arg(long = "static-auth-secret")]
    pub static_auth_secrets: Vec<String>,

    /// Separator between the timestamp and the user part of a TURN
    /// REST API username.
    #[arg(short = 'C', long, default_value_t = ':')]
    pub rest_api_separator: char,

    /// Flat-file user database: `username:password` or
    /// `username:0x<key>` lines, `#` comments.
    #[arg(short = 'b', long)]
    pub userdb: Option<PathBuf>,

    /// Do not start UDP client listeners.
    #[arg(long)]
    pub no_udp: bool,

    /// Do not start TCP client listeners.
    #[arg(long)]
    pub no_tcp: bool,

    /// Do not start TLS client listeners.
    #[arg(long)]
    pub no_tls: bool,

    /// Do not start DTLS client listeners.
    #[arg(long)]
    pub no_dtls: bool,

    /// Refuse UDP relay allocations.
    #[arg(long)]
    pub no_udp_relay: bool,

    /// Refuse TCP relay allocations (RFC 6062).
    #[arg(long)]
    pub no_tcp_relay: bool,

    /// Nonce lifetime in seconds.
    #[arg(long, default_value_t = 600)]
    pub stale_nonce: u64,

    /// Serve STUN Binding only, refuse every TURN method.
    #[arg(short = 'S', long)]
    pub stun_only: bool,

    /// Require authentication for STUN Binding requests too.
    #[arg(long)]
    pub secure_stun: bool,

    /// Disallow peers on well-known broadcast addresses.
    #[arg(long)]
    pub no_multicast_peers: bool,

    /// Disallow peers on the loopback addresses.
    #[arg(long)]
    pub no_loopback_peers: bool,

    /// Peer address or range permissions may always cover, `ip` or
    /// `ip/prefix`. Punches holes into denied ranges.
    #[arg(long = "allowed-peer-ip")]
    pub allowed_peer_ips: Vec<String>,

    /// Peer address or range permissions must never cover.
    #[arg(long = "denied-peer-ip")]
    pub denied_peer_ips: Vec<String>,

    /// Seconds a session may wait for its first successful Allocate.
    #[arg(long, default_value_t = 60)]
    pub max_allocate_timeout: u64,

    /// Upper bound for allocation lifetimes in seconds.
    #[arg(long, default_value_t = 3600)]
    pub max_allocate_lifetime: u32,

    /// Max bytes-per-second a session may relay, input and output
    /// combined, 0 for no limit.
    #[arg(short = 's', long, default_value_t = 0)]
    pub max_bps: usize,

    /// Certificate file, PEM format.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key file, PEM format.
    #[arg(long)]
    pub pkey: Option<PathBuf>,

    /// Allowed TLS cipher list.
    #[arg(long)]
    pub cipher_list: Option<String>,

    /// Redirect all Allocate requests to this server (300 Try
    /// Alternate).
    #[arg(long)]
    pub alternate_server: Option<SocketAddr>,

    /// Redirect TLS Allocate requests to this server.
    #[arg(long)]
    pub tls_alternate_server: Option<SocketAddr>,

    /// Allow sessions to resume from a new transport address with a
    /// mobility ticket.
    #[arg(long)]
    pub mobility: bool,

    /// Non-standard RFC 6062 mode: accept peer connections without a
    /// matching permission.
    #[arg(long)]
    pub server_relay: bool,

    /// Moderate verbosity; give twice for the full packet trace.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// PID file path.
    #[arg(long, default_value = "/var/run/turnserver.pid")]
    pub pidfile: PathBuf,

    /// Configuration file with `key value` or `key=value` lines and
    /// `#` comments, holding the same long option names.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Do not read any configuration file.
    #[arg(short = 'n', long)]
    pub no_config_file: bool,
}

impl Config {
    /// Load the command line, folding in the configuration file when
    /// one is given. File values sit before the command line ones, so
    /// the command line wins for single-valued options.
    pub fn load() -> anyhow::Result<Self> {
        let probe = Self::parse();

        let config = if probe.no_config_file { None } else { probe.config.clone() };
        let Some(path) = config else {
            return probe.validated();
        };

        let content = read_to_string(&path)
            .with_context(|| format!("read config file failed: {:?}", path))?;

        let mut args: Vec<String> = std::env::args().take(1).collect();
        args.extend(file_arguments(&content));
        args.extend(std::env::args().skip(1));

        Self::try_parse_from(args)
            .with_context(|| format!("parse config file failed: {:?}", path))?
            .validated()
    }

    fn validated(self) -> anyhow::Result<Self> {
        if self.min_port > self.max_port {
            return Err(anyhow!("min-port must not exceed max-port"));
        }

        if [self.lt_cred_mech, self.st_cred_mech, self.no_auth]
            .iter()
            .filter(|it| **it)
            .count()
            > 1
        {
            return Err(anyhow!("credential mechanisms are mutually exclusive"));
        }

        if self.use_auth_secret && self.static_auth_secrets.is_empty() {
            return Err(anyhow!("use-auth-secret requires a static-auth-secret"));
        }

        for user in &self.users {
            if !user.contains(':') {
                return Err(anyhow!("malformed user entry (want user:pwd): {}", user));
            }
        }

        Ok(self)
    }

    pub fn log_level(&self) -> log::Level {
        match self.verbose {
            0 => log::Level::Info,
            1 => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }

    pub fn static_users(&self) -> Vec<StaticUser> {
        self.users
            .iter()
            .filter_map(|it| it.split_once(':'))
            .map(|(username, password)| StaticUser {
                username: username.to_string(),
                password: password.to_string(),
            })
            .collect()
    }

    /// The addresses client listeners bind on.
    pub fn listening_ips(&self) -> Vec<IpAddr> {
        if self.listening_ips.is_empty() {
            vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
        } else {
            self.listening_ips.clone()
        }
    }

    /// The addresses relay sockets bind on: the configured relay IPs,
    /// or the listening addresses when none are named.
    pub fn effective_relay_ips(&self) -> Vec<IpAddr> {
        if !self.relay_ips.is_empty() {
            return self.relay_ips.clone();
        }

        self.listening_ips()
    }

    pub fn alt_port(&self) -> u16 {
        self.alt_listening_port
            .unwrap_or(self.listening_port.wrapping_add(1))
    }

    pub fn alt_tls_port(&self) -> u16 {
        self.alt_tls_listening_port
            .unwrap_or(self.tls_listening_port.wrapping_add(1))
    }

    pub fn workers(&self) -> usize {
        self.relay_threads.unwrap_or_else(num_cpus::get).min(128)
    }

    fn credentials(&self) -> Credentials {
        if self.no_auth {
            Credentials::NoAuth
        } else if self.st_cred_mech {
            Credentials::ShortTerm
        } else if self.use_auth_secret {
            Credentials::TimedSecret {
                secrets: self.static_auth_secrets.clone(),
                separator: self.rest_api_separator,
            }
        } else if self.lt_cred_mech || !self.users.is_empty() || self.userdb.is_some() {
            Credentials::LongTerm
        } else {
            Credentials::NoAuth
        }
    }

    fn peer_policy(&self) -> anyhow::Result<PeerPolicy> {
        let parse = |items: &[String]| -> anyhow::Result<Vec<IpPattern>> {
            items
                .iter()
                .map(|it| it.parse().map_err(|e| anyhow!("{}", e)))
                .collect()
        };

        Ok(PeerPolicy {
            allowed: parse(&self.allowed_peer_ips)?,
            denied: parse(&self.denied_peer_ips)?,
            no_multicast: self.no_multicast_peers,
            no_loopback: self.no_loopback_peers,
        })
    }

    fn external_mappings(&self) -> anyhow::Result<Vec<(IpAddr, Option<IpAddr>)>> {
        self.external_ips
            .iter()
            .map(|it| {
                Ok(match it.split_once('/') {
                    Some((public, private)) => (
                        public.parse().context("malformed external-ip")?,
                        Some(private.parse().context("malformed external-ip")?),
                    ),
                    None => (it.parse().context("malformed external-ip")?, None),
                })
            })
            .collect()
    }

    /// The protocol-level configuration handed to the service crate.
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        Ok(ServiceConfig {
            realm: self.realm.clone(),
            software: concat!("turn-relay-", env!("CARGO_PKG_VERSION")).to_string(),
            credentials: self.credentials(),
            port_range: PortRange::new(self.min_port, self.max_port),
            relay_ips: self.effective_relay_ips(),
            external_ips: self.external_mappings()?,
            alternate_server: self.alternate_server,
            tls_alternate_server: self.tls_alternate_server,
            user_quota: self.user_quota,
            total_quota: self.total_quota,
            max_bps: self.max_bps,
            max_lifetime: self.max_allocate_lifetime,
            max_allocate_timeout: self.max_allocate_timeout,
            nonce_lifetime: self.stale_nonce,
            peer_policy: self.peer_policy()?,
            flags: ServiceFlags {
                stun_only: self.stun_only,
                secure_stun: self.secure_stun,
                no_udp_relay: self.no_udp_relay,
                no_tcp_relay: self.no_tcp_relay,
                mobility: self.mobility,
                server_relay: self.server_relay,
            },
        })
    }
}

/// Expand `key value` / `key=value` lines into `--key value` argument
/// pairs. Flags stand alone on their line.
fn file_arguments(content: &str) -> Vec<String> {
    let mut args = Vec::new();

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let (key, value) = match line.split_once(['=', ' ', '\t']) {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (line, None),
        };

        args.push(format!("--{}", key));
        if let Some(value) = value.filter(|it| !it.is_empty()) {
            args.push(value.to_string());
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_arguments_accept_both_forms() {
        let content = "
            # a comment
            listening-port 3578
            realm=example.org
            no-udp
            user alice:secret   # trailing comment
        ";

        assert_eq!(
            file_arguments(content),
            vec![
                "--listening-port",
                "3578",
                "--realm",
                "example.org",
                "--no-udp",
                "--user",
                "alice:secret"
            ]
        );
    }

    #[test]
    fn command_line_wins_over_file() {
        let args = ["turn-relay", "--listening-port", "4000"];
        let mut full: Vec<String> = vec!["turn-relay".to_string()];
        full.extend(file_arguments("listening-port 3578"));
        full.extend(args.iter().skip(1).map(|it| it.to_string()));

        let config = Config::try_parse_from(full).unwrap();
        assert_eq!(config.listening_port, 4000);
    }

    #[test]
    fn mechanisms_are_exclusive() {
        let config =
            Config::try_parse_from(["turn-relay", "--no-auth", "--lt-cred-mech"]).unwrap();

        assert!(config.validated().is_err());
    }

    #[test]
    fn alt_ports_default_to_plus_one() {
        let config = Config::try_parse_from(["turn-relay"]).unwrap();

        assert_eq!(config.alt_port(), 3479);
        assert_eq!(config.alt_tls_port(), 5350);
    }
}
