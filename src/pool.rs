//! Bounded pool of authenticated SMTP sessions, reused across many sends per
//! dial.

use std::collections::VecDeque;
use std::time::Instant;

use mail_send::SmtpClient;
use mail_send::SmtpClientBuilder;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::boundary::{SmtpConfig, TlsMode};
use crate::error::{PoolError, SessionError};

/// A dialed, authenticated SMTP session. Exactly one of the three variants is
/// populated, matching the pool's configured `TlsMode`.
enum Transport {
    Starttls(SmtpClient<TlsStream<TcpStream>>),
    Implicit(SmtpClient<TlsStream<TcpStream>>),
    Plain(SmtpClient<TcpStream>),
}

pub struct PooledSession {
    transport: Transport,
    messages_sent: u32,
    last_used: Instant,
}

impl PooledSession {
    /// Sends one already-built envelope over this session.
    pub async fn send_one(
        &mut self,
        message: mail_send::smtp::message::Message<'_>,
    ) -> Result<(), SessionError> {
        let result = match &mut self.transport {
            Transport::Starttls(client) | Transport::Implicit(client) => {
                client.send(message).await
            }
            Transport::Plain(client) => client.send(message).await,
        };
        self.last_used = Instant::now();
        result.map_err(SessionError::from)?;
        self.messages_sent += 1;
        Ok(())
    }

    async fn quit(self) {
        let result = match self.transport {
            Transport::Starttls(client) | Transport::Implicit(client) => client.quit().await,
            Transport::Plain(client) => client.quit().await,
        };
        if let Err(err) = result {
            debug!(error = %err, "failed to cleanly close SMTP session");
        }
    }
}

/// Bounded set of pooled SMTP sessions. Sessions are dialed lazily up to
/// `capacity`; idle healthy sessions are reused; a session past its message
/// cap is retired and replaced on next demand.
pub struct ConnectionPool {
    config: SmtpConfig,
    capacity: usize,
    idle: Mutex<VecDeque<PooledSession>>,
    outstanding: Mutex<usize>,
    notify: Notify,
}

impl ConnectionPool {
    pub fn new(config: SmtpConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: capacity.max(1),
            idle: Mutex::new(VecDeque::new()),
            outstanding: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    /// Acquires a session, reusing an idle one if healthy and available,
    /// dialing a fresh one if capacity remains, or waiting for a release.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledSession, PoolError> {
        loop {
            {
                let mut idle = self.idle.lock().await;
                if let Some(session) = idle.pop_front() {
                    let mut outstanding = self.outstanding.lock().await;
                    *outstanding += 1;
                    return Ok(session);
                }
            }

            {
                let mut outstanding = self.outstanding.lock().await;
                if *outstanding < self.capacity {
                    *outstanding += 1;
                    drop(outstanding);
                    match self.dial().await {
                        Ok(session) => return Ok(session),
                        Err(err) => {
                            let mut outstanding = self.outstanding.lock().await;
                            *outstanding -= 1;
                            drop(outstanding);
                            self.notify.notify_one();
                            return Err(err);
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Returns a session to the pool. Unhealthy sessions (and sessions past
    /// their per-session message cap) are closed instead of reused.
    pub async fn release(&self, session: PooledSession, healthy: bool) {
        let retire = !healthy || session.messages_sent >= self.config.max_messages_per_session;

        if retire {
            trace!(
                messages_sent = session.messages_sent,
                healthy, "retiring pooled SMTP session"
            );
            session.quit().await;
        } else {
            self.idle.lock().await.push_back(session);
        }

        let mut outstanding = self.outstanding.lock().await;
        *outstanding -= 1;
        drop(outstanding);
        self.notify.notify_one();
    }

    async fn dial(&self) -> Result<PooledSession, PoolError> {
        let builder = SmtpClientBuilder::new(self.config.host.as_str(), self.config.port)
            .credentials((self.config.username.as_str(), self.config.password.as_str()))
            .timeout(self.config.dial_timeout());

        let builder = match &self.config.helo_name {
            Some(name) => builder.helo_host(name),
            None => builder,
        };

        let transport = match self.config.tls {
            TlsMode::Implicit => {
                let client = builder
                    .implicit_tls(true)
                    .connect()
                    .await
                    .map_err(|source| PoolError::Dial {
                        host: self.config.host.clone(),
                        port: self.config.port,
                        source,
                    })?;
                Transport::Implicit(client)
            }
            TlsMode::Starttls => {
                let client =
                    builder
                        .implicit_tls(false)
                        .connect()
                        .await
                        .map_err(|source| PoolError::Dial {
                            host: self.config.host.clone(),
                            port: self.config.port,
                            source,
                        })?;
                Transport::Starttls(client)
            }
            TlsMode::Plain => {
                let client =
                    builder
                        .implicit_tls(false)
                        .connect_plain()
                        .await
                        .map_err(|source| PoolError::Dial {
                            host: self.config.host.clone(),
                            port: self.config.port,
                            source,
                        })?;
                Transport::Plain(client)
            }
        };

        debug!(host = %self.config.host, port = self.config.port, "dialed new SMTP session");

        Ok(PooledSession {
            transport,
            messages_sent: 0,
            last_used: Instant::now(),
        })
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Best-effort: idle sessions left in the pool at drop time are simply
        // dropped along with their underlying sockets; no explicit QUIT is
        // sent, matching the pool's "trust the release hint" failure model.
        if let Ok(idle) = self.idle.try_lock() {
            if !idle.is_empty() {
                warn!(count = idle.len(), "dropping pool with idle sessions still open");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    /// Mirrors the teacher's own `random_port` test helper.
    fn random_port() -> u16 {
        use rand::Rng;
        rand::rng().random_range(10_000..30_000)
    }

    fn test_config(port: u16) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "user".to_string(),
            password: "pass".to_string(),
            from: "sender@example.com".to_string(),
            tls: TlsMode::Plain,
            helo_name: None,
            connect_timeout: std::time::Duration::from_secs(2),
            read_timeout: std::time::Duration::from_secs(2),
            write_timeout: std::time::Duration::from_secs(2),
            max_messages_per_session: 100,
        }
    }

    /// Dials against a real local dev SMTP server (`mailcrab`, the same one
    /// the teacher uses in its own integration tests) rather than the
    /// hand-rolled stub, to exercise the pool against genuine server
    /// behavior at least once.
    #[tokio::test]
    async fn outstanding_sessions_never_exceed_capacity() {
        let port = random_port();
        let mailcrab::TestMailServerHandle { token, rx: _rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _drop_guard = token.drop_guard();

        let pool = Arc::new(ConnectionPool::new(test_config(port), 2));
        let cancel = CancellationToken::new();

        let s1 = pool.acquire(&cancel).await.unwrap();
        let s2 = pool.acquire(&cancel).await.unwrap();

        let pool_for_third = pool.clone();
        let cancel_for_third = cancel.clone();
        let third = tokio::spawn(async move { pool_for_third.acquire(&cancel_for_third).await });

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(
            !third.is_finished(),
            "a third acquire must block while capacity (2) is already outstanding"
        );

        pool.release(s1, true).await;
        let s3 = third.await.unwrap().unwrap();
        pool.release(s2, true).await;
        pool.release(s3, true).await;
    }
}
