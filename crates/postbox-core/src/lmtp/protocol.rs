//! LMTP command state machine
//!
//! [`Session`] performs no I/O. Each call returns the [`Response`] to write
//! and an [`Action`] the transport must carry out; the transport reports
//! the outcome back through the feedback methods (`recipient_checked`,
//! `data_received`, `delivered`, `tls_established`, ...). Both transport
//! bindings drive the same type, so their replies cannot diverge.

use crate::lmtp::address::{Address, MAIL_PARAMETERS, RCPT_PARAMETERS};
use crate::lmtp::envelope::{BodyType, Envelope};
use crate::lmtp::framer::FramedMessage;
use crate::lmtp::reply::{Reply, ReplyContext};
use postbox_common::config::Config;
use tracing::debug;

/// Per-connection protocol settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub idle_timeout_secs: u64,
    pub lhlo_required: bool,
    pub tls_required: bool,
    /// STARTTLS can be offered on this listener
    pub starttls_available: bool,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub recipient_delimiter: Option<char>,
}

impl SessionConfig {
    pub fn from_config(config: &Config, tls_configured: bool) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            idle_timeout_secs: config.lmtp.idle_timeout_secs,
            lhlo_required: config.lmtp.lhlo_required,
            tls_required: config.lmtp.tls_required,
            starttls_available: config.lmtp.starttls && tls_configured,
            max_message_size: config.lmtp.max_message_size,
            max_recipients: config.lmtp.max_recipients,
            recipient_delimiter: config.lmtp.recipient_delimiter,
        }
    }

    pub fn reply_context(&self) -> ReplyContext {
        ReplyContext {
            hostname: self.hostname.clone(),
            idle_timeout_secs: self.idle_timeout_secs,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default(), false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingCommand,
    ReceivingData,
    Closed,
}

/// What to write back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Nothing to send yet
    Empty,
    Single(Reply),
    /// `250-` continuation lines followed by a final `250 ` line
    Capabilities(Vec<String>),
    /// One reply per recipient, in RCPT order
    PerRecipient(Vec<Reply>),
}

impl Response {
    pub fn render(&self, ctx: &ReplyContext) -> String {
        match self {
            Response::Empty => String::new(),
            Response::Single(reply) => reply.format(ctx),
            Response::Capabilities(lines) => {
                let mut out = String::new();
                for (i, line) in lines.iter().enumerate() {
                    let sep = if i + 1 == lines.len() { ' ' } else { '-' };
                    out.push_str(&format!("250{}{}\r\n", sep, line));
                }
                out
            }
            Response::PerRecipient(replies) => replies.iter().map(|r| r.format(ctx)).collect(),
        }
    }
}

/// Side effect the transport must perform
#[derive(Debug)]
pub enum Action {
    None,
    /// Resolve the address and call [`Session::recipient_checked`]
    CheckRecipient(Address),
    /// Switch to DATA framing and call [`Session::data_received`]
    ReceiveData,
    /// Hand the envelope and body to delivery and call [`Session::delivered`]
    Deliver(Envelope, Vec<u8>),
    /// Run the TLS handshake and call [`Session::tls_established`]
    StartTls,
    Close,
}

/// Protocol state of one connection
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: State,
    envelope: Envelope,
    lhlo_done: bool,
    tls_active: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: State::AwaitingCommand,
            envelope: Envelope::new(),
            lhlo_done: false,
            tls_active: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn reply_context(&self) -> ReplyContext {
        self.config.reply_context()
    }

    /// Size limit for the DATA framer
    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    pub fn greeting(&self) -> Response {
        Response::Single(Reply::GREETING)
    }

    /// Process one command line (without its line terminator)
    pub fn command(&mut self, line: &str) -> (Response, Action) {
        match self.state {
            State::Closed => return (Response::Empty, Action::Close),
            State::ReceivingData => return single(Reply::SYNTAX_ERROR),
            State::AwaitingCommand => {}
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v, a.trim()),
            None => (line, ""),
        };

        if verb.len() < 4 {
            return single(Reply::SYNTAX_ERROR);
        }
        let verb = verb.to_ascii_uppercase();

        let gated = matches!(
            verb.as_str(),
            "MAIL" | "RCPT" | "DATA" | "RSET" | "NOOP" | "VRFY"
        );
        if gated && self.config.lhlo_required && !self.lhlo_done {
            return single(Reply::NEED_LHLO);
        }

        match verb.as_str() {
            "LHLO" => self.lhlo(arg),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.data(),
            "RSET" => {
                self.envelope.reset();
                single(Reply::OK)
            }
            "NOOP" => single(Reply::OK),
            "VRFY" => single(Reply::USE_RCPT_INSTEAD),
            "QUIT" => {
                self.state = State::Closed;
                (Response::Single(Reply::BYE), Action::Close)
            }
            "STARTTLS" => self.starttls(arg),
            _ => single(Reply::SYNTAX_ERROR),
        }
    }

    fn lhlo(&mut self, arg: &str) -> (Response, Action) {
        if arg.is_empty() {
            return single(Reply::SYNTAX_ERROR);
        }
        self.envelope.reset();
        self.lhlo_done = true;

        let mut lines = vec![
            self.config.hostname.clone(),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            format!("SIZE {}", self.config.max_message_size),
        ];
        if self.config.starttls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        lines.push("PIPELINING".to_string());
        (Response::Capabilities(lines), Action::None)
    }

    fn mail(&mut self, arg: &str) -> (Response, Action) {
        if self.config.tls_required && !self.tls_active {
            return single(Reply::MUST_STARTTLS);
        }
        if self.envelope.has_sender() {
            return single(Reply::NESTED_MAIL_COMMAND);
        }
        let Some(path) = strip_keyword(arg, "FROM:") else {
            return single(Reply::SYNTAX_ERROR);
        };

        let sender = Address::parse(path, MAIL_PARAMETERS, None);
        if !sender.is_valid() {
            return single(Reply::INVALID_SENDER_ADDRESS);
        }

        let body = match sender.parameter("BODY") {
            Some(value) => match BodyType::parse(value) {
                Some(b) => Some(b),
                None => return single(Reply::INVALID_BODY_PARAMETER),
            },
            None => None,
        };
        let size = match sender.parameter("SIZE") {
            Some(value) => match value.parse::<u64>() {
                Ok(s) => Some(s),
                Err(_) => return single(Reply::INVALID_SIZE_PARAMETER),
            },
            None => None,
        };
        if size.is_some_and(|s| s > self.config.max_message_size as u64) {
            return single(Reply::MESSAGE_TOO_BIG);
        }

        debug!(sender = %sender, "MAIL accepted");
        self.envelope.set_sender(sender, size, body);
        single(Reply::SENDER_OK)
    }

    fn rcpt(&mut self, arg: &str) -> (Response, Action) {
        if !self.envelope.has_sender() {
            return single(Reply::MISSING_MAIL_FROM);
        }
        let Some(path) = strip_keyword(arg, "TO:") else {
            return single(Reply::SYNTAX_ERROR);
        };

        let recipient = Address::parse(path, RCPT_PARAMETERS, self.config.recipient_delimiter);
        if !recipient.is_valid() || recipient.is_null() {
            return single(Reply::INVALID_RECIPIENT_ADDRESS);
        }
        if self.envelope.recipients().len() >= self.config.max_recipients {
            return single(Reply::TOO_MANY_RECIPIENTS);
        }
        (Response::Empty, Action::CheckRecipient(recipient))
    }

    /// Result of the status check requested by `CheckRecipient`
    pub fn recipient_checked(&mut self, recipient: Address, status: Reply) -> Response {
        if status.success() {
            debug!(recipient = %recipient, "RCPT accepted");
            if self.envelope.add_recipient(recipient).is_err() {
                return Response::Single(Reply::MISSING_MAIL_FROM);
            }
        }
        Response::Single(status)
    }

    fn data(&mut self) -> (Response, Action) {
        if !self.envelope.has_recipients() {
            return single(Reply::NO_RECIPIENTS);
        }
        self.state = State::ReceivingData;
        (Response::Single(Reply::OK_TO_SEND_DATA), Action::ReceiveData)
    }

    /// DATA payload fully framed
    pub fn data_received(&mut self, message: FramedMessage) -> (Response, Action) {
        if message.oversized {
            let replies = vec![Reply::MESSAGE_TOO_BIG; self.envelope.recipients().len()];
            self.finish_transaction();
            return (Response::PerRecipient(replies), Action::None);
        }
        let envelope = std::mem::take(&mut self.envelope);
        (Response::Empty, Action::Deliver(envelope, message.body))
    }

    /// Per-recipient delivery outcome, in RCPT order
    pub fn delivered(&mut self, replies: Vec<Reply>) -> Response {
        self.finish_transaction();
        Response::PerRecipient(replies)
    }

    /// The connection ended mid-DATA or delivery could not stage the body
    pub fn data_aborted(&mut self) {
        self.envelope.reset();
        self.state = State::Closed;
    }

    fn finish_transaction(&mut self) {
        self.envelope.reset();
        self.state = State::AwaitingCommand;
    }

    fn starttls(&mut self, arg: &str) -> (Response, Action) {
        if !arg.is_empty() {
            return single(Reply::SYNTAX_ERROR);
        }
        if !self.config.starttls_available || self.tls_active {
            return single(Reply::STARTTLS_NOT_AVAILABLE);
        }
        (Response::Single(Reply::READY_TO_START_TLS), Action::StartTls)
    }

    pub fn tls_established(&mut self) {
        self.tls_active = true;
    }

    /// No input within the idle window
    pub fn idle_timeout(&mut self) -> Response {
        self.envelope.reset();
        self.state = State::Closed;
        Response::Single(Reply::TIMEOUT)
    }
}

fn single(reply: Reply) -> (Response, Action) {
    (Response::Single(reply), Action::None)
}

/// `FROM:<a@b>` / `from: <a@b>` → `<a@b>`
fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &arg[keyword.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session::new(SessionConfig {
            recipient_delimiter: Some('+'),
            ..SessionConfig::default()
        })
    }

    fn reply_of(session: &mut Session, line: &str) -> Reply {
        match session.command(line) {
            (Response::Single(r), Action::None) => r,
            (Response::Single(r), Action::Close) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Run RCPT through a status check that accepts everyone
    fn rcpt_ok(session: &mut Session, line: &str) -> Reply {
        match session.command(line) {
            (Response::Empty, Action::CheckRecipient(addr)) => {
                match session.recipient_checked(addr, Reply::RECIPIENT_OK) {
                    Response::Single(r) => r,
                    other => panic!("unexpected {:?}", other),
                }
            }
            (Response::Single(r), _) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lhlo_capabilities() {
        let mut s = session();
        let (response, _) = s.command("LHLO client.example.com");
        let text = response.render(&s.reply_context());
        assert_eq!(
            text,
            "250-localhost\r\n250-8BITMIME\r\n250-ENHANCEDSTATUSCODES\r\n250-SIZE 26214400\r\n250 PIPELINING\r\n"
        );
        assert_eq!(reply_of(&mut s, "LHLO"), Reply::SYNTAX_ERROR);
    }

    #[test]
    fn test_command_sequencing() {
        let mut s = session();
        s.command("LHLO x");
        assert_eq!(rcpt_ok(&mut s, "RCPT TO:<b@y>"), Reply::MISSING_MAIL_FROM);
        assert_eq!(reply_of(&mut s, "DATA"), Reply::NO_RECIPIENTS);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::SENDER_OK);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::NESTED_MAIL_COMMAND);
        assert_eq!(reply_of(&mut s, "DATA"), Reply::NO_RECIPIENTS);
        assert_eq!(rcpt_ok(&mut s, "rcpt to:<b+tag@y>"), Reply::RECIPIENT_OK);
        assert_eq!(s.envelope().recipients()[0].email_address(), "b@y");
        assert_eq!(reply_of(&mut s, "RSET"), Reply::OK);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::SENDER_OK);
    }

    #[test]
    fn test_syntax_errors() {
        let mut s = session();
        s.command("LHLO x");
        assert_eq!(reply_of(&mut s, "HI"), Reply::SYNTAX_ERROR);
        assert_eq!(reply_of(&mut s, "EHLO x"), Reply::SYNTAX_ERROR);
        assert_eq!(reply_of(&mut s, "MAIL <a@x>"), Reply::SYNTAX_ERROR);
        assert_eq!(reply_of(&mut s, "MAIL FROM:a@x"), Reply::INVALID_SENDER_ADDRESS);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x> BODY=BINARY"), Reply::INVALID_BODY_PARAMETER);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x> SIZE=big"), Reply::INVALID_SIZE_PARAMETER);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x> SIZE=999999999999"), Reply::MESSAGE_TOO_BIG);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<> BODY=8bitmime SIZE=10"), Reply::SENDER_OK);
        assert_eq!(s.envelope().size(), Some(10));
        assert_eq!(rcpt_ok(&mut s, "RCPT TO:<>"), Reply::INVALID_RECIPIENT_ADDRESS);
        assert_eq!(rcpt_ok(&mut s, "RCPT TO:<b@y> BODY=7BIT"), Reply::INVALID_RECIPIENT_ADDRESS);
        assert_eq!(reply_of(&mut s, "VRFY"), Reply::USE_RCPT_INSTEAD);
        assert_eq!(reply_of(&mut s, "VRFY anyone@x"), Reply::USE_RCPT_INSTEAD);
    }

    #[test]
    fn test_lhlo_required() {
        let mut s = session();
        for cmd in ["NOOP", "RSET", "VRFY x", "MAIL FROM:<a@x>", "RCPT TO:<b@y>", "DATA"] {
            assert_eq!(reply_of(&mut s, cmd), Reply::NEED_LHLO, "{}", cmd);
        }

        let mut relaxed = Session::new(SessionConfig {
            lhlo_required: false,
            ..SessionConfig::default()
        });
        assert_eq!(reply_of(&mut relaxed, "NOOP"), Reply::OK);
    }

    #[test]
    fn test_starttls_negotiation() {
        let mut s = Session::new(SessionConfig {
            starttls_available: true,
            tls_required: true,
            ..SessionConfig::default()
        });
        let (caps, _) = s.command("LHLO x");
        assert!(caps.render(&s.reply_context()).contains("250-STARTTLS\r\n"));
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::MUST_STARTTLS);
        assert_eq!(reply_of(&mut s, "STARTTLS now"), Reply::SYNTAX_ERROR);

        match s.command("STARTTLS") {
            (Response::Single(r), Action::StartTls) => assert_eq!(r, Reply::READY_TO_START_TLS),
            other => panic!("unexpected {:?}", other),
        }
        s.tls_established();

        let (caps, _) = s.command("LHLO x");
        assert!(!caps.render(&s.reply_context()).contains("STARTTLS"));
        assert_eq!(reply_of(&mut s, "STARTTLS"), Reply::STARTTLS_NOT_AVAILABLE);
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::SENDER_OK);
    }

    #[test]
    fn test_data_cycle() {
        let mut s = session();
        s.command("LHLO x");
        s.command("MAIL FROM:<a@x>");
        rcpt_ok(&mut s, "RCPT TO:<b@y>");
        rcpt_ok(&mut s, "RCPT TO:<c@y>");

        match s.command("DATA") {
            (Response::Single(r), Action::ReceiveData) => assert_eq!(r, Reply::OK_TO_SEND_DATA),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.state(), State::ReceivingData);

        let framed = FramedMessage {
            body: b"hello\r\n".to_vec(),
            oversized: false,
        };
        let (envelope, body) = match s.data_received(framed) {
            (Response::Empty, Action::Deliver(env, body)) => (env, body),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(envelope.recipients().len(), 2);
        assert_eq!(body, b"hello\r\n");

        let response = s.delivered(vec![Reply::DELIVERY_OK, Reply::TEMPORARY_FAILURE]);
        assert_eq!(
            response.render(&s.reply_context()),
            "250 2.1.5 Delivery OK\r\n451 4.0.0 Temporary message delivery failure try again\r\n"
        );
        assert_eq!(s.state(), State::AwaitingCommand);
        assert!(!s.envelope().has_sender());
        assert_eq!(reply_of(&mut s, "MAIL FROM:<a@x>"), Reply::SENDER_OK);
    }

    #[test]
    fn test_oversized_data() {
        let mut s = session();
        s.command("LHLO x");
        s.command("MAIL FROM:<a@x>");
        rcpt_ok(&mut s, "RCPT TO:<b@y>");
        s.command("DATA");
        let (response, action) = s.data_received(FramedMessage {
            body: Vec::new(),
            oversized: true,
        });
        assert!(matches!(action, Action::None));
        assert_eq!(response, Response::PerRecipient(vec![Reply::MESSAGE_TOO_BIG]));
    }

    #[test]
    fn test_rejected_recipient_not_added() {
        let mut s = session();
        s.command("LHLO x");
        s.command("MAIL FROM:<a@x>");
        let (_, action) = s.command("RCPT TO:<nobody@y>");
        let Action::CheckRecipient(addr) = action else {
            panic!("expected recipient check");
        };
        assert_eq!(
            s.recipient_checked(addr, Reply::NO_SUCH_USER),
            Response::Single(Reply::NO_SUCH_USER)
        );
        assert_eq!(reply_of(&mut s, "DATA"), Reply::NO_RECIPIENTS);
    }

    #[test]
    fn test_too_many_recipients() {
        let mut s = Session::new(SessionConfig {
            max_recipients: 1,
            ..SessionConfig::default()
        });
        s.command("LHLO x");
        s.command("MAIL FROM:<a@x>");
        assert_eq!(rcpt_ok(&mut s, "RCPT TO:<b@y>"), Reply::RECIPIENT_OK);
        assert_eq!(rcpt_ok(&mut s, "RCPT TO:<c@y>"), Reply::TOO_MANY_RECIPIENTS);
    }

    #[test]
    fn test_quit_and_timeout_close() {
        let mut s = session();
        match s.command("quit") {
            (Response::Single(r), Action::Close) => assert_eq!(r, Reply::BYE),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.state(), State::Closed);

        let mut s = session();
        assert_eq!(s.idle_timeout(), Response::Single(Reply::TIMEOUT));
        assert_eq!(s.state(), State::Closed);
    }
}
