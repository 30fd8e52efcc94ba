//! Reading delivery metadata out of raw messages.
//!
//! A submitted message may carry its own identifier in `X-Courier-MailID` and
//! an expiry in `X-Courier-Expiry`, formatted `yyyy-MM-ddTHH:mm:ss.SSS` and
//! read as UTC. Recipients are collected from `To`, `Cc` and `Bcc`.

use chrono::{DateTime, NaiveDateTime, Utc};
use courier_spool::MailId;
use mailparse::{MailAddr, MailHeaderMap};
use tracing::warn;

use crate::error::{ManagerError, PermanentError};

pub const MAIL_ID_HEADER: &str = "X-Courier-MailID";
pub const EXPIRY_HEADER: &str = "X-Courier-Expiry";
pub const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const RECIPIENT_HEADERS: [&str; 3] = ["To", "Cc", "Bcc"];

/// Delivery metadata found in a message's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub mail_id: Option<MailId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub recipients: Vec<String>,
}

impl MessageHeaders {
    /// Parse the header block of `raw`.
    ///
    /// An unreadable expiry is ignored with a warning, leaving the configured
    /// default retention to apply.
    ///
    /// # Errors
    /// If the header block cannot be parsed.
    pub fn parse(raw: &[u8]) -> Result<Self, ManagerError> {
        let (headers, _) = mailparse::parse_headers(raw)?;

        let mail_id = headers
            .get_first_value(MAIL_ID_HEADER)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(MailId::from);

        let expires_at = headers
            .get_first_value(EXPIRY_HEADER)
            .and_then(|value| match parse_expiry(&value) {
                Some(expiry) => Some(expiry),
                None => {
                    warn!(value = %value, "Ignoring unreadable {EXPIRY_HEADER} header");
                    None
                }
            });

        let mut recipients = Vec::new();
        for name in RECIPIENT_HEADERS {
            for header in headers.get_all_headers(name) {
                let addresses = mailparse::addrparse_header(header)?;
                for address in addresses.iter() {
                    match address {
                        MailAddr::Single(single) => recipients.push(single.addr.clone()),
                        MailAddr::Group(group) => {
                            recipients.extend(group.addrs.iter().map(|single| single.addr.clone()));
                        }
                    }
                }
            }
        }

        Ok(Self {
            mail_id,
            expires_at,
            recipients,
        })
    }
}

/// Parse an `X-Courier-Expiry` value.
#[must_use]
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), EXPIRY_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format an expiry for the `X-Courier-Expiry` header.
#[must_use]
pub fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.format(EXPIRY_FORMAT).to_string()
}

/// A recipient split into mailbox and domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub local_part: String,
    pub domain: String,
}

impl Recipient {
    /// Parse a single recipient, with or without a display name.
    ///
    /// # Errors
    /// [`PermanentError::InvalidRecipient`] when the value is not exactly one
    /// `local@domain` mailbox.
    pub fn parse(value: &str) -> Result<Self, PermanentError> {
        let invalid = || PermanentError::InvalidRecipient(value.to_string());

        let addresses = mailparse::addrparse(value).map_err(|_| invalid())?;
        let address = match addresses.as_slice() {
            [MailAddr::Single(single)] => single.addr.trim().to_string(),
            _ => return Err(invalid()),
        };

        let (local_part, domain) = address.rsplit_once('@').ok_or_else(invalid)?;
        if local_part.is_empty()
            || domain.is_empty()
            || domain.starts_with('.')
            || domain.ends_with('.')
            || domain.contains(char::is_whitespace)
            || local_part.contains(char::is_whitespace)
        {
            return Err(invalid());
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_ascii_lowercase(),
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_headers() {
        let raw = b"X-Courier-MailID: 1700000000.2a\r\n\
X-Courier-Expiry: 2030-01-02T03:04:05.678\r\n\
To: Alice <alice@example.com>, bob@example.org\r\n\
Cc: Friends: carol@example.net, dave@example.net;\r\n\
Bcc: eve@example.com\r\n\
Subject: Hello\r\n\r\nBody\r\n";

        let headers = MessageHeaders::parse(raw).unwrap();

        assert_eq!(headers.mail_id, Some(MailId::from("1700000000.2a")));
        assert_eq!(
            headers.expires_at,
            Some(
                Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()
                    + chrono::Duration::milliseconds(678)
            )
        );
        assert_eq!(
            headers.recipients,
            vec![
                "alice@example.com",
                "bob@example.org",
                "carol@example.net",
                "dave@example.net",
                "eve@example.com",
            ]
        );
    }

    #[test]
    fn test_headers_absent() {
        let headers = MessageHeaders::parse(b"Subject: Hello\r\n\r\nBody").unwrap();
        assert_eq!(headers, MessageHeaders::default());
    }

    #[test]
    fn test_unreadable_expiry_is_ignored() {
        let headers =
            MessageHeaders::parse(b"X-Courier-Expiry: tomorrow\r\nTo: a@b.org\r\n\r\n").unwrap();
        assert_eq!(headers.expires_at, None);
        assert_eq!(headers.recipients, vec!["a@b.org"]);
    }

    #[test]
    fn test_expiry_format_round_trip() {
        let expiry = Utc.with_ymd_and_hms(2031, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(format_expiry(expiry), "2031-12-31T23:59:58.000");
        assert_eq!(parse_expiry(&format_expiry(expiry)), Some(expiry));
    }

    #[test]
    fn test_recipient_parse() {
        let recipient = Recipient::parse("Alice <alice@Example.COM>").unwrap();
        assert_eq!(recipient.address, "alice@Example.COM");
        assert_eq!(recipient.local_part, "alice");
        assert_eq!(recipient.domain, "example.com");
    }

    #[test]
    fn test_malformed_recipients() {
        for value in [
            "",
            "not-an-address",
            "@example.com",
            "user@",
            "a@b.org, c@d.org",
            "user@.example.com",
        ] {
            assert!(
                matches!(
                    Recipient::parse(value),
                    Err(PermanentError::InvalidRecipient(_))
                ),
                "{value:?} should be rejected"
            );
        }
    }
}
