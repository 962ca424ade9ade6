//! Transaction envelope

use crate::lmtp::address::Address;
use crate::lmtp::reply::Reply;
use thiserror::Error;

/// Declared body encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

impl BodyType {
    /// Parse a `BODY=` value, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("7BIT") {
            Some(BodyType::SevenBit)
        } else if s.eq_ignore_ascii_case("8BITMIME") {
            Some(BodyType::EightBitMime)
        } else {
            None
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("recipient added before sender")]
    MissingSender,
}

/// Sender, recipients and declared properties of one transaction
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
    size: Option<u64>,
    body: Option<BodyType>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, sender: Address, size: Option<u64>, body: Option<BodyType>) {
        self.sender = Some(sender);
        self.size = size;
        self.body = body;
    }

    pub fn add_recipient(&mut self, recipient: Address) -> Result<(), EnvelopeError> {
        if self.sender.is_none() {
            return Err(EnvelopeError::MissingSender);
        }
        self.recipients.push(recipient);
        Ok(())
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    pub fn has_recipients(&self) -> bool {
        !self.recipients.is_empty()
    }

    pub fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// Sender email, empty for the null path
    pub fn sender_email(&self) -> String {
        self.sender
            .as_ref()
            .map(Address::email_address)
            .unwrap_or_default()
    }

    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    pub fn recipients_mut(&mut self) -> &mut [Address] {
        &mut self.recipients
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn body(&self) -> Option<BodyType> {
        self.body
    }

    /// Clear the transaction
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.size = None;
        self.body = None;
    }

    /// Indices of recipients routed to this node
    pub fn local_recipients(&self) -> Vec<usize> {
        self.recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| r.on_local_server())
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of remote recipients grouped by server, in first-seen order
    pub fn remote_recipients_by_server(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, r) in self.recipients.iter().enumerate() {
            if r.on_local_server() {
                continue;
            }
            let Some(server) = r.remote_server() else {
                continue;
            };
            match groups.iter_mut().find(|(s, _)| s == server) {
                Some((_, members)) => members.push(i),
                None => groups.push((server.to_string(), vec![i])),
            }
        }
        groups
    }

    pub fn set_delivery_statuses(&mut self, indices: &[usize], reply: Reply) {
        for &i in indices {
            if let Some(r) = self.recipients.get_mut(i) {
                r.set_delivery_status(reply);
            }
        }
    }

    /// Statuses in recipient order; recipients never resolved get a
    /// temporary failure
    pub fn delivery_statuses(&self) -> Vec<Reply> {
        self.recipients
            .iter()
            .map(|r| r.delivery_status().unwrap_or(Reply::TEMPORARY_FAILURE))
            .collect()
    }
}
