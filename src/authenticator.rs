use std::path::Path;

use ahash::{HashMap, HashMapExt};
use anyhow::{Context, anyhow};
use service::Credential;
use tokio::sync::{mpsc, oneshot};

use crate::config::StaticUser;

/// A key lookup travelling to the auth worker. The oneshot is the
/// resume handle: the worker answers into it and the suspended request
/// picks the session back up by id, never by pointer.
pub struct AuthRequest {
    pub username: String,
    pub reply: oneshot::Sender<Option<Credential>>,
}

/// The authentication worker.
///
/// One dedicated task owns the user database; workers talk to it over
/// a message queue and suspend the request until the answer returns.
/// A session torn down mid-flight just drops its receiving end.
#[derive(Clone)]
pub struct Authenticator {
    queue: mpsc::Sender<AuthRequest>,
}

impl Authenticator {
    /// Load the static accounts and the flat-file database, then start
    /// the worker.
    pub fn spawn(users: Vec<StaticUser>, userdb: Option<&Path>) -> anyhow::Result<Self> {
        let mut table = HashMap::with_capacity(users.len().max(16));

        for user in users {
            table.insert(user.username, Credential::Password(user.password));
        }

        if let Some(path) = userdb {
            load_userdb(path, &mut table)?;
        }

        log::info!("authenticator started: users={}", table.len());

        let (queue, mut incoming) = mpsc::channel::<AuthRequest>(256);
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let credential = table.get(&request.username).cloned();
                let _ = request.reply.send(credential);
            }
        });

        Ok(Self { queue })
    }

    pub async fn lookup(&self, username: &str) -> Option<Credential> {
        let (reply, result) = oneshot::channel();

        self.queue
            .send(AuthRequest {
                username: username.to_string(),
                reply,
            })
            .await
            .ok()?;

        result.await.ok().flatten()
    }
}

/// The flat-file user database: one `username:password` per line, or
/// `username:0x<hex>` for a precomputed long-term key; `#` comments.
fn load_userdb(path: &Path, table: &mut HashMap<String, Credential>) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read user database failed: {:?}", path))?;

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let (username, secret) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed userdb line: {}", line))?;

        let credential = match secret.strip_prefix("0x") {
            Some(hex) => Credential::Key(parse_key(hex)?),
            None => Credential::Password(secret.to_string()),
        };

        table.insert(username.to_string(), credential);
    }

    Ok(())
}

fn parse_key(hex: &str) -> anyhow::Result<[u8; 16]> {
    if hex.len() != 32 {
        return Err(anyhow!("a long-term key is 32 hex characters: {}", hex));
    }

    let mut key = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let chunk = std::str::from_utf8(chunk)?;
        key[i] = u8::from_str_radix(chunk, 16).with_context(|| format!("bad hex: {}", chunk))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_parse_from_hex() {
        let key = parse_key("0123456789abcdef0123456789ABCDEF").unwrap();
        assert_eq!(key[0], 0x01);
        assert_eq!(key[15], 0xEF);

        assert!(parse_key("0123").is_err());
        assert!(parse_key("zz23456789abcdef0123456789abcdef").is_err());
    }

    #[tokio::test]
    async fn lookup_round_trip() {
        let authenticator = Authenticator::spawn(
            vec![StaticUser {
                username: "alice".to_string(),
                password: "secret".to_string(),
            }],
            None,
        )
        .unwrap();

        assert!(matches!(
            authenticator.lookup("alice").await,
            Some(Credential::Password(it)) if it == "secret"
        ));

        assert!(authenticator.lookup("bob").await.is_none());
    }
}
