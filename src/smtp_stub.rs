//! Minimal in-process SMTP responder used only by `pool` and `dispatcher`
//! integration tests. Not a protocol implementation meant for reuse outside
//! tests: it accepts a bounded vocabulary of commands and answers with the
//! same reply codes and text the teacher's own SMTP responder
//! (`smtp::session::SmtpSession`) sends for the same commands, including the
//! EHLO capability line built the same way with `smtp_proto::EhloResponse`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use smtp_proto::{EhloResponse, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One accepted, fully-received SMTP transaction.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: String,
}

/// Decides the RCPT TO reply for a recipient, given how many times (across
/// all connections) that recipient has already been offered, 1-indexed.
pub type RcptPolicy = Arc<dyn Fn(&str, u32) -> (u16, &'static str) + Send + Sync>;

pub fn always_accept() -> RcptPolicy {
    Arc::new(|_, _| (250, "2.1.5 Recipient ok"))
}

/// Rejects the first attempt for every recipient with a transient 4xx,
/// accepts every attempt after that — models a relay recovering from a brief
/// outage.
pub fn fail_first_attempt() -> RcptPolicy {
    Arc::new(|_, attempt| {
        if attempt == 1 {
            (450, "4.3.2 Mailbox temporarily unavailable")
        } else {
            (250, "2.1.5 Recipient ok")
        }
    })
}

pub struct StubServer {
    addr: SocketAddr,
    accept_loop: JoinHandle<()>,
    captured: Arc<Mutex<Vec<CapturedMessage>>>,
}

impl StubServer {
    pub async fn spawn(policy: RcptPolicy) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind stub smtp listener");
        let addr = listener.local_addr().expect("stub listener local addr");

        let captured = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(Mutex::new(HashMap::<String, u32>::new()));

        let captured_bg = captured.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let captured = captured_bg.clone();
                let attempts = attempts.clone();
                let policy = policy.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, policy, captured, attempts).await;
                });
            }
        });

        Self { addr, accept_loop, captured }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn captured(&self) -> Vec<CapturedMessage> {
        self.captured.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn extract_address(line: &str) -> String {
    match (line.find('<'), line.find('>')) {
        (Some(start), Some(end)) if end > start => line[start + 1..end].to_string(),
        _ => line.split_whitespace().last().unwrap_or_default().to_string(),
    }
}

async fn serve_one(
    stream: TcpStream,
    policy: RcptPolicy,
    captured: Arc<Mutex<Vec<CapturedMessage>>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"220 localhost stub SMTP ready\r\n").await?;

    let mut mail_from = String::new();
    let mut rcpt_to: Vec<String> = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim_end();
        let upper = cmd.to_ascii_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            let host = cmd.split_whitespace().nth(1).unwrap_or("client");
            let mut response = EhloResponse::new(host);
            response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8 | EXT_AUTH;
            response.auth_mechanisms = AUTH_PLAIN;
            let mut buf = Vec::with_capacity(64);
            response.write(&mut buf).ok();
            writer.write_all(&buf).await?;
        } else if upper.starts_with("AUTH PLAIN") {
            if upper.trim() == "AUTH PLAIN" {
                writer.write_all(b"334 Tell me your secret.\r\n").await?;
                line.clear();
                reader.read_line(&mut line).await?;
            }
            writer.write_all(b"235 2.7.0 Authentication succeeded.\r\n").await?;
        } else if upper.starts_with("MAIL FROM") {
            mail_from = extract_address(cmd);
            let text = format!("2.1.0 Originator <{mail_from}> ok");
            writer.write_all(format!("250 {text}\r\n").as_bytes()).await?;
        } else if upper.starts_with("RCPT TO") {
            let addr = extract_address(cmd);
            let attempt = {
                let mut attempts = attempts.lock().unwrap();
                let counter = attempts.entry(addr.to_lowercase()).or_insert(0);
                *counter += 1;
                *counter
            };
            let (code, text) = policy(&addr, attempt);
            writer.write_all(format!("{code} {text}\r\n").as_bytes()).await?;
            if code < 400 {
                rcpt_to.push(addr);
            }
        } else if upper.starts_with("DATA") {
            writer
                .write_all(b"354 3.5.4 Start mail input; end with <CRLF>.<CRLF>\r\n")
                .await?;
            let mut body = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                body.push_str(&line);
            }
            captured.lock().unwrap().push(CapturedMessage {
                mail_from: mail_from.clone(),
                rcpt_to: rcpt_to.clone(),
                data: body,
            });
            rcpt_to.clear();
            writer.write_all(b"250 2.6.0 Message queued for delivery\r\n").await?;
        } else if upper.starts_with("RSET") {
            mail_from.clear();
            rcpt_to.clear();
            writer.write_all(b"250 2.0.0 Ok\r\n").await?;
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 2.0.0 Goodbye\r\n").await?;
            return Ok(());
        } else {
            writer.write_all(b"500 5.5.1 Command not recognized\r\n").await?;
        }
    }
}
