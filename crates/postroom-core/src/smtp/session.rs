//! SMTP session handling

use super::auth::{decode_login, decode_plain, login_challenge_password, login_challenge_username};
use super::server::SmtpServiceType;
use crate::bridge::Bridge;
use anyhow::{anyhow, Result};
use postroom_common::types::{EmailAddress, Envelope, RoomId};
use postroom_common::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// How the command loop ended
enum SessionEnd {
    Closed,
    StartTls,
}

/// Per-listener session settings
#[derive(Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub service: SmtpServiceType,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub timeout: Duration,
    pub tls: Option<TlsAcceptor>,
}

/// One SMTP connection
pub struct SmtpSession {
    bridge: Arc<Bridge>,
    config: SessionConfig,
    peer: String,
    state: SessionState,
    envelope: Envelope,
    /// Room the client logged in for
    authenticated: Option<RoomId>,
    tls_active: bool,
}

impl SmtpSession {
    pub fn new(bridge: Arc<Bridge>, config: SessionConfig, peer: String) -> Self {
        let envelope = Envelope {
            client_addr: Some(peer.clone()),
            ..Envelope::default()
        };
        Self {
            bridge,
            config,
            peer,
            state: SessionState::Connected,
            envelope,
            authenticated: None,
            tls_active: false,
        }
    }

    /// Run the session until the client quits or the connection drops
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);

        if !self.admit(&mut stream).await? {
            return Ok(());
        }

        let greeting = format!("{} ESMTP Postroom", self.config.hostname);
        self.send_response(&mut stream, 220, &greeting).await?;

        if let SessionEnd::StartTls = self.run(&mut stream).await? {
            let Some(acceptor) = self.config.tls.clone() else {
                return Ok(());
            };
            let tls_stream = acceptor.accept(stream.into_inner()).await?;
            debug!(addr = %self.peer, "TLS established");

            // The client starts over with EHLO
            self.tls_active = true;
            self.state = SessionState::Connected;
            self.reset_transaction();

            let mut tls_stream = BufReader::new(tls_stream);
            self.run(&mut tls_stream).await?;
        }
        Ok(())
    }

    /// Banlist and DNSBL gate before the greeting
    async fn admit<S>(&self, stream: &mut BufReader<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let guard = self.bridge.guard();
        if guard.is_banned(&self.peer).await {
            info!(addr = %self.peer, "Rejecting banned client");
            self.send_response(stream, 554, "5.7.1 Banned").await?;
            return Ok(false);
        }
        if guard.check_dnsbls(&self.peer).await {
            self.send_response(stream, 450, "4.7.1 Blacklisted by DNSBL")
                .await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run<S>(&mut self, stream: &mut BufReader<S>) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            let Some(bytes_read) = self.read_line(stream, &mut line).await? else {
                info!(addr = %self.peer, "Idle timeout");
                self.send_response(stream, 421, "4.4.2 Idle timeout, closing connection")
                    .await?;
                return Ok(SessionEnd::Closed);
            };
            if bytes_read == 0 {
                debug!(addr = %self.peer, "Client disconnected");
                return Ok(SessionEnd::Closed);
            }

            let (command, args) = parse_command(line.trim());
            let command = command.to_uppercase();
            // AUTH arguments carry credentials
            if command == "AUTH" {
                debug!("SMTP from {}: AUTH ...", self.peer);
            } else {
                debug!("SMTP from {}: {}", self.peer, line.trim());
            }

            match command.as_str() {
                "HELO" => {
                    self.envelope.helo = Some(args.to_string());
                    self.state = SessionState::Greeted;
                    self.reset_transaction();
                    let reply = format!("{} Hello {}", self.config.hostname, args);
                    self.send_response(stream, 250, &reply).await?;
                }
                "EHLO" => {
                    self.ehlo(stream, args).await?;
                }
                "STARTTLS" => {
                    if self.config.tls.is_none() || self.tls_active {
                        self.send_response(stream, 502, "5.5.1 STARTTLS not available")
                            .await?;
                        continue;
                    }
                    if self.state != SessionState::Greeted {
                        self.send_response(stream, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }
                    self.send_response(stream, 220, "2.0.0 Ready to start TLS")
                        .await?;
                    return Ok(SessionEnd::StartTls);
                }
                "AUTH" => {
                    self.auth(stream, args).await?;
                }
                "MAIL" => {
                    self.mail(stream, args).await?;
                }
                "RCPT" => {
                    self.rcpt(stream, args).await?;
                }
                "DATA" => {
                    self.data(stream).await?;
                }
                "RSET" => {
                    self.reset_transaction();
                    if self.state != SessionState::Connected {
                        self.state = SessionState::Greeted;
                    }
                    self.send_response(stream, 250, "2.0.0 OK").await?;
                }
                "NOOP" => {
                    self.send_response(stream, 250, "2.0.0 OK").await?;
                }
                "QUIT" => {
                    self.send_response(stream, 221, "2.0.0 Bye").await?;
                    return Ok(SessionEnd::Closed);
                }
                "VRFY" => {
                    self.send_response(stream, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }
                "EXPN" => {
                    self.send_response(stream, 502, "5.5.1 EXPN not supported")
                        .await?;
                }
                _ => {
                    self.send_response(stream, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }
    }

    async fn ehlo<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.envelope.helo = Some(args.to_string());
        self.state = SessionState::Greeted;
        self.reset_transaction();

        let mut responses = vec![
            format!("{} Hello {}", self.config.hostname, args),
            format!("SIZE {}", self.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.config.tls.is_some() && !self.tls_active {
            responses.push("STARTTLS".to_string());
        }
        responses.push("AUTH PLAIN LOGIN".to_string());

        let last = responses.len() - 1;
        for (i, response) in responses.iter().enumerate() {
            if i == last {
                self.send_response(stream, 250, response).await?;
            } else {
                self.send_response_continue(stream, 250, response).await?;
            }
        }
        Ok(())
    }

    async fn auth<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::Greeted {
            return self
                .send_response(stream, 503, "5.5.1 Bad sequence of commands")
                .await;
        }
        if self.authenticated.is_some() {
            return self
                .send_response(stream, 503, "5.5.1 Already authenticated")
                .await;
        }

        let (mechanism, initial) = match args.trim().split_once(' ') {
            Some((mechanism, initial)) => (mechanism.to_uppercase(), Some(initial.trim().to_string())),
            None => (args.trim().to_uppercase(), None),
        };

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(response) => response,
                    None => {
                        self.send_response(stream, 334, "").await?;
                        match self.read_auth_line(stream).await? {
                            Some(response) => response,
                            None => return Ok(()),
                        }
                    }
                };
                if response == "*" {
                    return self
                        .send_response(stream, 501, "5.0.0 Authentication cancelled")
                        .await;
                }
                decode_plain(&response).map(|c| (c.username, c.password))
            }
            "LOGIN" => {
                let username = match initial {
                    Some(username) => username,
                    None => {
                        self.send_response(stream, 334, &login_challenge_username())
                            .await?;
                        match self.read_auth_line(stream).await? {
                            Some(username) => username,
                            None => return Ok(()),
                        }
                    }
                };
                self.send_response(stream, 334, &login_challenge_password())
                    .await?;
                let Some(password) = self.read_auth_line(stream).await? else {
                    return Ok(());
                };
                match (decode_login(&username), decode_login(&password)) {
                    (Some(username), Some(password)) if !username.trim().is_empty() => {
                        Some((username.trim().to_string(), password))
                    }
                    _ => None,
                }
            }
            _ => {
                return self
                    .send_response(stream, 504, "5.5.4 Unrecognized authentication mechanism")
                    .await;
            }
        };

        let Some((username, password)) = credentials else {
            let banned = self.bridge.guard().ban_auth(&self.peer).await;
            warn!(addr = %self.peer, banned, "Malformed AUTH credentials");
            return self
                .send_response(stream, 501, "5.5.2 Malformed credentials")
                .await;
        };

        match self.bridge.allow_auth(&username, &password).await {
            Some(room) => {
                info!(addr = %self.peer, mailbox = %username, room = %room, "Client authenticated");
                self.authenticated = Some(room);
                self.send_response(stream, 235, "2.7.0 Authentication successful")
                    .await
            }
            None => {
                info!(addr = %self.peer, mailbox = %username, "Authentication failed");
                self.send_response(stream, 535, "5.7.8 Authentication credentials invalid")
                    .await
            }
        }
    }

    async fn mail<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::Greeted {
            return self
                .send_response(stream, 503, "5.5.1 Bad sequence of commands")
                .await;
        }
        if self.config.service == SmtpServiceType::Submission && self.authenticated.is_none() {
            return self
                .send_response(stream, 530, "5.7.0 Authentication required")
                .await;
        }

        let Some(from) = parse_mail_from(args) else {
            return self
                .send_response(stream, 501, "5.1.7 Bad sender address syntax")
                .await;
        };

        if self.authenticated.is_none() && self.bridge.guard().is_greylisted(&self.peer).await {
            info!(addr = %self.peer, "Greylisted");
            return self
                .send_response(stream, 451, "4.7.1 Greylisted, please try again later")
                .await;
        }

        self.envelope.from = from;
        self.state = SessionState::MailFrom;
        self.send_response(stream, 250, "2.1.0 OK").await
    }

    async fn rcpt<S>(&mut self, stream: &mut BufReader<S>, args: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::MailFrom && self.state != SessionState::RcptTo {
            return self
                .send_response(stream, 503, "5.5.1 Bad sequence of commands")
                .await;
        }

        let Some(rcpt) = parse_rcpt_to(args) else {
            return self
                .send_response(stream, 501, "5.1.3 Bad recipient address syntax")
                .await;
        };

        if self.envelope.to.len() >= self.config.max_recipients {
            return self
                .send_response(stream, 452, "4.5.3 Too many recipients")
                .await;
        }

        // Logged-in clients send anywhere; everyone else only reaches our rooms
        if self.authenticated.is_none() && self.bridge.resolve(&rcpt.to_string()).await.is_none() {
            let banned = self.bridge.guard().ban_auto(&self.peer).await;
            info!(addr = %self.peer, rcpt = %rcpt, banned, "Unknown recipient");
            return self.send_response(stream, 550, "5.1.1 No such user").await;
        }

        self.envelope.to.push(rcpt);
        self.state = SessionState::RcptTo;
        self.send_response(stream, 250, "2.1.5 OK").await
    }

    async fn data<S>(&mut self, stream: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::RcptTo || self.envelope.to.is_empty() {
            return self
                .send_response(stream, 503, "5.5.1 Bad sequence of commands")
                .await;
        }

        self.send_response(stream, 354, "Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let Some(data) = self.read_data(stream).await? else {
            self.reset_transaction();
            return self
                .send_response(stream, 552, "5.3.4 Message size exceeds fixed limit")
                .await;
        };

        let result = match &self.authenticated {
            Some(room) => self.bridge.submit(room, &self.envelope, &data).await,
            None => self.bridge.incoming_email(&self.envelope, &data).await,
        };
        self.reset_transaction();

        match result {
            Ok(()) => {
                info!(addr = %self.peer, size = data.len(), "Message accepted");
                self.send_response(stream, 250, "2.0.0 OK: message accepted")
                    .await
            }
            Err(e) => {
                warn!(addr = %self.peer, "Message rejected: {}", e);
                let (code, text) = rejection(&e);
                self.send_response(stream, code, text).await
            }
        }
    }

    /// Read message data up to the lone dot.
    ///
    /// Returns `None` once the message has outgrown the size limit; the rest
    /// is still drained so the session stays in sync.
    async fn read_data<S>(&self, stream: &mut BufReader<S>) -> Result<Option<Vec<u8>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;
        let mut at_line_start = true;
        // A single read never buffers more than a full message plus CRLF
        let limit = self.config.max_message_size.saturating_add(2) as u64;

        loop {
            line.clear();
            let mut bounded = (&mut *stream).take(limit);
            let read = bounded.read_until(b'\n', &mut line);
            let bytes_read = match tokio::time::timeout(self.config.timeout, read).await {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("Timeout during DATA from {}", self.peer)),
            };
            if bytes_read == 0 {
                return Err(anyhow!("Connection closed during DATA"));
            }
            let starts_line = at_line_start;
            at_line_start = line.last() == Some(&b'\n');

            if starts_line && (line == b".\r\n" || line == b".\n") {
                break;
            }
            if too_large {
                continue;
            }

            // Dot-unstuffing
            let content = if starts_line && line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line[..]
            };
            data.extend_from_slice(content);

            if data.len() > self.config.max_message_size {
                warn!(addr = %self.peer, "Message exceeds size limit");
                too_large = true;
                data.clear();
            }
        }

        Ok((!too_large).then_some(data))
    }

    async fn read_line<S>(&self, stream: &mut BufReader<S>, line: &mut String) -> Result<Option<usize>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.config.timeout, stream.read_line(line)).await {
            Ok(result) => Ok(Some(result?)),
            Err(_) => Ok(None),
        }
    }

    /// One line of an AUTH exchange, `None` when the client went away
    async fn read_auth_line<S>(&self, stream: &mut BufReader<S>) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();
        match self.read_line(stream, &mut line).await? {
            Some(0) | None => Ok(None),
            Some(_) => Ok(Some(line.trim().to_string())),
        }
    }

    fn reset_transaction(&mut self) {
        self.envelope.from = None;
        self.envelope.to.clear();
        if self.state == SessionState::MailFrom || self.state == SessionState::RcptTo {
            self.state = SessionState::Greeted;
        }
    }

    /// Send a single-line response
    async fn send_response<S>(&self, writer: &mut BufReader<S>, code: u16, message: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }

    /// Send a multi-line response (intermediate line)
    async fn send_response_continue<S>(
        &self,
        writer: &mut BufReader<S>,
        code: u16,
        message: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!("SMTP to {}: {}", self.peer, response.trim());
        Ok(())
    }
}

/// Reply for a message the bridge refused
fn rejection(error: &Error) -> (u16, &'static str) {
    let text = match error {
        Error::NotFound(_) => "5.1.1 No such user",
        Error::Validation(_) => "5.7.1 Message rejected",
        Error::PermissionDenied(_) => "5.7.1 Sender not allowed",
        Error::Auth(_) => "5.7.8 Authentication required",
        _ => "4.3.0 Temporary failure, try again later",
    };
    (error.smtp_status(), text)
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    let mut parts = line.splitn(2, ' ');
    (parts.next().unwrap_or(""), parts.next().unwrap_or(""))
}

/// Strip a case-insensitive `FROM:`/`TO:` keyword
fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let args = args.trim();
    let prefix = args.get(..keyword.len())?;
    prefix
        .eq_ignore_ascii_case(keyword)
        .then(|| args[keyword.len()..].trim())
}

/// Address inside angle brackets, or the first word
fn extract_path(addr_part: &str) -> Option<&str> {
    if addr_part.starts_with('<') {
        let end = addr_part.find('>')?;
        Some(&addr_part[1..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

/// Parse MAIL FROM:<address> or MAIL FROM: <address>
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let addr_part = strip_keyword(args, "FROM:")?;

    // Null sender
    if addr_part == "<>" || addr_part.starts_with("<> ") {
        return Some(None);
    }

    let email = extract_path(addr_part)?;
    if email.is_empty() {
        Some(None)
    } else {
        EmailAddress::parse(email).map(Some)
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let addr_part = strip_keyword(args, "TO:")?;
    EmailAddress::parse(extract_path(addr_part)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::{harness_with_mailbox, Harness, ROOM};
    use crate::guard::GuardPolicy;
    use crate::settings;
    use crate::smtp::hash_password;
    use crate::test_support::{RecordingChat, ScriptedTransport};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use pretty_assertions::assert_eq;
    use tokio::io::DuplexStream;

    const PEER: &str = "203.0.113.5:40000";

    struct Client {
        stream: BufReader<DuplexStream>,
    }

    impl Client {
        /// Last line of the next reply
        async fn reply(&mut self) -> String {
            let mut line = String::new();
            loop {
                line.clear();
                self.stream.read_line(&mut line).await.unwrap();
                assert!(!line.is_empty(), "connection closed");
                if line.as_bytes().get(3) != Some(&b'-') {
                    return line.trim_end().to_string();
                }
            }
        }

        async fn send(&mut self, command: &str) -> String {
            self.stream
                .write_all(format!("{}\r\n", command).as_bytes())
                .await
                .unwrap();
            self.reply().await
        }

        async fn send_data(&mut self, message: &str) -> String {
            self.stream.write_all(message.as_bytes()).await.unwrap();
            self.stream.write_all(b".\r\n").await.unwrap();
            self.reply().await
        }
    }

    fn session_config(service: SmtpServiceType, max_message_size: usize) -> SessionConfig {
        SessionConfig {
            hostname: "mail.example.com".to_string(),
            service,
            max_message_size,
            max_recipients: 2,
            timeout: Duration::from_secs(5),
            tls: None,
        }
    }

    struct Setup {
        bridge: Arc<Bridge>,
        chat: Arc<RecordingChat>,
        transport: Arc<ScriptedTransport>,
        store: Arc<dyn postroom_storage::KvStore>,
    }

    async fn setup() -> Setup {
        let Harness {
            bridge,
            chat,
            transport,
            store,
        } = harness_with_mailbox().await;
        Setup {
            bridge: Arc::new(bridge),
            chat,
            transport,
            store,
        }
    }

    fn connect(bridge: &Arc<Bridge>, config: SessionConfig) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = SmtpSession::new(bridge.clone(), config, PEER.to_string());
        tokio::spawn(async move {
            let _ = session.handle(server).await;
        });
        Client {
            stream: BufReader::new(client),
        }
    }

    const INBOUND: &str = "From: Alice <alice@example.net>\r\n\
To: sales@example.com\r\n\
Subject: Quote\r\n\
Message-ID: <m1@example.net>\r\n\
\r\n\
Hello\r\n\
..leading dot\r\n";

    #[tokio::test]
    async fn test_inbound_delivery() {
        let s = setup().await;
        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 1024 * 1024));

        assert_eq!(client.reply().await, "220 mail.example.com ESMTP Postroom");
        assert_eq!(client.send("EHLO mx.example.net").await, "250 AUTH PLAIN LOGIN");
        assert_eq!(client.send("MAIL FROM:<alice@example.net>").await, "250 2.1.0 OK");
        assert_eq!(client.send("RCPT TO:<nobody@example.com>").await, "550 5.1.1 No such user");
        assert_eq!(client.send("RCPT TO:<sales@example.com>").await, "250 2.1.5 OK");
        assert!(client.send("DATA").await.starts_with("354"));
        assert_eq!(client.send_data(INBOUND).await, "250 2.0.0 OK: message accepted");
        assert_eq!(client.send("QUIT").await, "221 2.0.0 Bye");

        let messages = s.chat.messages(ROOM);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.body.contains(".leading dot"));
        assert!(!messages[0].1.body.contains("..leading dot"));
    }

    #[tokio::test]
    async fn test_bad_sequence() {
        let s = setup().await;
        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 1024));
        client.reply().await;

        assert_eq!(
            client.send("MAIL FROM:<alice@example.net>").await,
            "503 5.5.1 Bad sequence of commands"
        );
        client.send("HELO mx.example.net").await;
        assert_eq!(client.send("DATA").await, "503 5.5.1 Bad sequence of commands");
        assert_eq!(client.send("MAIL FROM:alice").await, "501 5.1.7 Bad sender address syntax");
        assert_eq!(client.send("STARTTLS").await, "502 5.5.1 STARTTLS not available");
        assert_eq!(client.send("FOO").await, "500 5.5.2 Command not recognized");
    }

    #[tokio::test]
    async fn test_recipient_limit() {
        let s = setup().await;
        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 1024));
        client.reply().await;
        client.send("EHLO mx.example.net").await;
        client.send("MAIL FROM:<>").await;
        assert_eq!(client.send("RCPT TO:<sales@example.com>").await, "250 2.1.5 OK");
        assert_eq!(client.send("RCPT TO:<sales+a@example.com>").await, "250 2.1.5 OK");
        assert_eq!(
            client.send("RCPT TO:<sales+b@example.com>").await,
            "452 4.5.3 Too many recipients"
        );
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let s = setup().await;
        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 32));
        client.reply().await;
        client.send("EHLO mx.example.net").await;
        client.send("MAIL FROM:<alice@example.net>").await;
        client.send("RCPT TO:<sales@example.com>").await;
        client.send("DATA").await;
        assert_eq!(
            client.send_data(INBOUND).await,
            "552 5.3.4 Message size exceeds fixed limit"
        );
        assert_eq!(client.send("NOOP").await, "250 2.0.0 OK");
        assert!(s.chat.messages(ROOM).is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_long_line_is_refused() {
        let s = setup().await;
        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 64));
        client.reply().await;
        client.send("EHLO mx.example.net").await;
        client.send("MAIL FROM:<alice@example.net>").await;
        client.send("RCPT TO:<sales@example.com>").await;
        client.send("DATA").await;

        // Ends in ".\r\n" without ever starting a line with it
        let mut flood = "x".repeat(1000);
        flood.push_str(".\r\n");
        client.stream.write_all(flood.as_bytes()).await.unwrap();
        assert_eq!(
            client.send_data("").await,
            "552 5.3.4 Message size exceeds fixed limit"
        );
        assert_eq!(client.send("NOOP").await, "250 2.0.0 OK");
        assert!(s.chat.messages(ROOM).is_empty());
    }

    #[tokio::test]
    async fn test_greylisting() {
        let s = setup().await;
        s.bridge
            .guard()
            .set_policy(GuardPolicy {
                greylist_minutes: 5,
                ..GuardPolicy::default()
            })
            .await;

        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 1024));
        client.reply().await;
        client.send("EHLO mx.example.net").await;
        assert_eq!(
            client.send("MAIL FROM:<alice@example.net>").await,
            "451 4.7.1 Greylisted, please try again later"
        );
    }

    #[tokio::test]
    async fn test_banned_client_is_turned_away() {
        let s = setup().await;
        s.bridge
            .guard()
            .set_policy(GuardPolicy {
                banlist: true,
                ..GuardPolicy::default()
            })
            .await;
        assert!(s.bridge.guard().ban_manually("203.0.113.5").await);

        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Smtp, 1024));
        assert_eq!(client.reply().await, "554 5.7.1 Banned");
    }

    #[tokio::test]
    async fn test_malformed_auth_bans() {
        let s = setup().await;
        s.bridge
            .guard()
            .set_policy(GuardPolicy {
                banlist: true,
                ..GuardPolicy::default()
            })
            .await;

        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Submission, 1024));
        client.reply().await;
        client.send("EHLO laptop").await;
        assert_eq!(client.send("AUTH PLAIN !!!").await, "501 5.5.2 Malformed credentials");
        assert!(s.bridge.guard().is_banned(PEER).await);
    }

    #[tokio::test]
    async fn test_submission_requires_auth_and_relays() {
        let s = setup().await;
        let mut room = settings::load_room(s.store.as_ref(), ROOM).await;
        room.set(settings::ROOM_PASSWORD, hash_password("pw").unwrap());
        settings::save_room(s.store.as_ref(), ROOM, room).await.unwrap();

        let mut client = connect(&s.bridge, session_config(SmtpServiceType::Submission, 1024 * 1024));
        client.reply().await;
        client.send("EHLO laptop").await;
        assert_eq!(
            client.send("MAIL FROM:<sales@example.com>").await,
            "530 5.7.0 Authentication required"
        );

        let wrong = BASE64.encode(b"\0sales@example.com\0nope");
        assert_eq!(
            client.send(&format!("AUTH PLAIN {}", wrong)).await,
            "535 5.7.8 Authentication credentials invalid"
        );

        assert_eq!(client.send("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.send(&BASE64.encode("sales@example.com")).await, "334 UGFzc3dvcmQ6");
        assert_eq!(
            client.send(&BASE64.encode("pw")).await,
            "235 2.7.0 Authentication successful"
        );

        assert_eq!(client.send("MAIL FROM:<sales@example.com>").await, "250 2.1.0 OK");
        assert_eq!(client.send("RCPT TO:<dave@example.net>").await, "250 2.1.5 OK");
        client.send("DATA").await;
        let message = "From: sales@example.com\r\n\
To: dave@example.net\r\n\
Subject: Offer\r\n\
Message-ID: <s1@example.com>\r\n\
\r\n\
Hello Dave\r\n";
        assert_eq!(client.send_data(message).await, "250 2.0.0 OK: message accepted");

        let sent = s.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["dave@example.net".to_string()]);
        assert_eq!(s.chat.messages(ROOM).len(), 1);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("MAIL FROM:<a@b.c>"), ("MAIL", "FROM:<a@b.c>"));
        assert_eq!(parse_command("QUIT"), ("QUIT", ""));
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );

        assert_eq!(
            parse_mail_from("from: <user@example.com> SIZE=1024"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );

        assert_eq!(parse_mail_from("FROM:<>"), Some(None));

        assert_eq!(parse_mail_from("invalid"), None);
        assert_eq!(parse_mail_from("FROM:<nodomain>"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );

        assert_eq!(
            parse_rcpt_to("TO: <user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );

        assert_eq!(parse_rcpt_to("TO:<>"), None);
        assert_eq!(parse_rcpt_to("TOO"), None);
    }

    #[test]
    fn test_rejection_codes() {
        assert_eq!(rejection(&Error::NotFound("x".into())).0, 550);
        assert_eq!(rejection(&Error::PermissionDenied("x".into())).0, 554);
        assert_eq!(rejection(&Error::Storage("x".into())).0, 451);
    }
}
