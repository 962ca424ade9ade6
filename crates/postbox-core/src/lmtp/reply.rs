//! LMTP reply catalog
//!
//! Every reply the server can send is a [`Reply`] constant. Detail text is
//! either static or computed when the reply is formatted, so banners pick up
//! the hostname and timeout in force at that moment.

use std::fmt;

/// Live values available to computed reply text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub hostname: String,
    pub idle_timeout_secs: u64,
}

impl Default for ReplyContext {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            idle_timeout_secs: 600,
        }
    }
}

/// Reply detail text
#[derive(Clone, Copy)]
pub enum Detail {
    Static(&'static str),
    Computed(fn(&ReplyContext) -> String),
}

/// A catalog entry
#[derive(Clone, Copy)]
pub struct Reply {
    name: &'static str,
    code: u16,
    enhanced: Option<&'static str>,
    detail: Detail,
}

fn greeting(ctx: &ReplyContext) -> String {
    format!("{} LMTP Postbox server ready", ctx.hostname)
}

fn bye(ctx: &ReplyContext) -> String {
    format!("{} closing connection", ctx.hostname)
}

fn timeout(ctx: &ReplyContext) -> String {
    format!(
        "{} Timeout exceeded ({} seconds), closing connection",
        ctx.hostname, ctx.idle_timeout_secs
    )
}

macro_rules! reply {
    ($name:ident, $code:expr, $enh:expr, $detail:expr) => {
        pub const $name: Reply = Reply {
            name: stringify!($name),
            code: $code,
            enhanced: $enh,
            detail: $detail,
        };
    };
}

impl Reply {
    reply!(GREETING, 220, None, Detail::Computed(greeting));
    reply!(READY_TO_START_TLS, 220, Some("2.0.0"), Detail::Static("Ready to start TLS"));
    reply!(BYE, 221, Some("2.0.0"), Detail::Computed(bye));
    reply!(OK, 250, Some("2.0.0"), Detail::Static("OK"));
    reply!(SENDER_OK, 250, Some("2.0.0"), Detail::Static("Sender OK"));
    reply!(RECIPIENT_OK, 250, Some("2.1.5"), Detail::Static("Recipient OK"));
    reply!(DELIVERY_OK, 250, Some("2.1.5"), Detail::Static("Delivery OK"));
    reply!(USE_RCPT_INSTEAD, 252, Some("2.3.3"), Detail::Static("Use RCPT to deliver messages"));
    reply!(OK_TO_SEND_DATA, 354, None, Detail::Static("End data with <CR><LF>.<CR><LF>"));

    reply!(SERVICE_DISABLED, 421, Some("4.3.2"), Detail::Static("Service not available, closing transmission channel"));
    reply!(TIMEOUT, 421, Some("4.4.2"), Detail::Computed(timeout));
    reply!(MAILBOX_NOT_ON_THIS_SERVER, 450, Some("4.2.0"), Detail::Static("Mailbox is not on this server"));
    reply!(MAILBOX_DISABLED, 450, Some("4.2.1"), Detail::Static("Mailbox disabled, not accepting messages"));
    reply!(TEMPORARY_FAILURE, 451, Some("4.0.0"), Detail::Static("Temporary message delivery failure try again"));
    reply!(TEMPORARY_FAILURE_OVER_QUOTA, 452, Some("4.2.2"), Detail::Static("Over quota"));
    reply!(TOO_MANY_RECIPIENTS, 452, Some("4.5.3"), Detail::Static("Too many recipients"));

    reply!(SYNTAX_ERROR, 500, Some("5.5.2"), Detail::Static("Syntax error"));
    reply!(INVALID_RECIPIENT_ADDRESS, 501, Some("5.1.3"), Detail::Static("Bad recipient address syntax"));
    reply!(INVALID_SENDER_ADDRESS, 501, Some("5.1.7"), Detail::Static("Bad sender address syntax"));
    reply!(INVALID_BODY_PARAMETER, 501, Some("5.5.4"), Detail::Static("Syntax error in BODY parameter"));
    reply!(INVALID_SIZE_PARAMETER, 501, Some("5.5.4"), Detail::Static("Syntax error in SIZE parameter"));
    reply!(STARTTLS_NOT_AVAILABLE, 502, Some("5.5.1"), Detail::Static("STARTTLS not available"));
    reply!(NESTED_MAIL_COMMAND, 503, Some("5.5.1"), Detail::Static("Nested MAIL command"));
    reply!(MISSING_MAIL_FROM, 503, Some("5.5.1"), Detail::Static("Need MAIL command"));
    reply!(NO_RECIPIENTS, 503, Some("5.5.1"), Detail::Static("No recipients"));
    reply!(NEED_LHLO, 503, Some("5.5.1"), Detail::Static("Need LHLO command"));
    reply!(MUST_STARTTLS, 530, Some("5.7.0"), Detail::Static("Must issue a STARTTLS command first"));
    reply!(NO_SUCH_USER, 550, Some("5.1.1"), Detail::Static("No such user here"));
    reply!(PERMANENT_MESSAGE_REFUSED, 550, Some("5.7.1"), Detail::Static("Message refused"));
    reply!(PERMANENT_FAILURE_OVER_QUOTA, 552, Some("5.2.2"), Detail::Static("Over quota"));
    reply!(MESSAGE_TOO_BIG, 552, Some("5.3.4"), Detail::Static("Message size exceeds fixed limit"));
    reply!(PERMANENT_FAILURE, 554, Some("5.0.0"), Detail::Static("Permanent message delivery failure"));
    reply!(LINE_TOO_LONG, 554, Some("5.6.0"), Detail::Static("Message line too long"));

    /// Catalog name, e.g. `DELIVERY_OK`
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn enhanced(&self) -> Option<&'static str> {
        self.enhanced
    }

    /// Code in [200, 400)
    pub fn success(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// 4xx class
    pub fn is_temporary(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn detail(&self, ctx: &ReplyContext) -> String {
        match self.detail {
            Detail::Static(text) => text.to_string(),
            Detail::Computed(f) => f(ctx),
        }
    }

    /// Reply line without the trailing CRLF
    pub fn text(&self, ctx: &ReplyContext) -> String {
        match self.enhanced {
            Some(enh) => format!("{} {} {}", self.code, enh, self.detail(ctx)),
            None => format!("{} {}", self.code, self.detail(ctx)),
        }
    }

    /// Wire form, `"<code> [<enhanced> ]<detail>\r\n"`
    pub fn format(&self, ctx: &ReplyContext) -> String {
        let mut line = self.text(ctx);
        line.push_str("\r\n");
        line
    }
}

impl PartialEq for Reply {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Reply {}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text(&ReplyContext::default()))
    }
}
