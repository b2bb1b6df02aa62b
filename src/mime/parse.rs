//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mirrormap.
//
// Mirrormap is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mirrormap is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mirrormap. If not, see <http://www.gnu.org/licenses/>.

//! Extraction of the metadata the engine caches about each message, and of
//! `BODY[section]` contents.

use std::fmt::Write as _;

use chrono::prelude::*;
use mailparse::{MailAddr, MailHeader, MailHeaderMap as _, ParsedMail};
use serde::{Deserialize, Serialize};

use super::header;
use crate::account::model::{Section, SectionText};
use crate::support::error::Error;

/// The `ENVELOPE` structure defined by RFC 3501.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The `Date` header, normalised if it could be parsed.
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    /// If empty, `from` is sent in its place.
    pub sender: Vec<Address>,
    /// If empty, `from` is sent in its place.
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// An address or group delimiter in an `ENVELOPE`.
///
/// A group is started with an address having a mailbox but no host, and
/// terminated with one having neither.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

/// The metadata cached in the database for each message.
#[derive(Clone, Debug)]
pub struct ParsedMessage {
    pub internal_date: DateTime<FixedOffset>,
    pub size: u32,
    pub envelope: Envelope,
    /// The pre-rendered `BODY` response.
    pub body: String,
    /// The pre-rendered `BODYSTRUCTURE` response.
    pub body_structure: String,
}

/// Parses `literal`, giving it `internal_date` or the current time.
pub fn parse_message(
    literal: &[u8],
    internal_date: Option<DateTime<FixedOffset>>,
) -> Result<ParsedMessage, Error> {
    let mail = mailparse::parse_mail(literal)?;

    Ok(ParsedMessage {
        internal_date: internal_date
            .unwrap_or_else(|| Utc::now().fixed_offset()),
        size: u32::try_from(literal.len()).unwrap_or(u32::MAX),
        envelope: Envelope::from_headers(&mail.headers),
        body: render_structure(&mail, false),
        body_structure: render_structure(&mail, true),
    })
}

impl Envelope {
    pub fn from_headers(headers: &[MailHeader<'_>]) -> Self {
        let text = |name: &str| {
            headers
                .get_first_value(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let addresses = |name: &str| {
            headers
                .get_first_header(name)
                .and_then(|h| mailparse::addrparse_header(h).ok())
                .map(|list| to_addresses(&list))
                .unwrap_or_default()
        };

        Envelope {
            date: text("Date").map(|raw| {
                header::parse_datetime(&raw)
                    .map(|dt| dt.to_rfc2822())
                    // Send whatever we have and let the client figure it out
                    .unwrap_or(raw)
            }),
            subject: text("Subject"),
            from: addresses("From"),
            sender: addresses("Sender"),
            reply_to: addresses("Reply-To"),
            to: addresses("To"),
            cc: addresses("Cc"),
            bcc: addresses("Bcc"),
            in_reply_to: text("In-Reply-To"),
            message_id: text("Message-Id"),
        }
    }

    /// The parsed `Date` header.
    pub fn sent_date(&self) -> Option<DateTime<FixedOffset>> {
        self.date.as_deref().and_then(header::parse_datetime)
    }

    /// Renders the envelope in IMAP syntax.
    pub fn to_imap(&self) -> String {
        let mut s = String::new();
        s.push('(');
        nstring(&mut s, self.date.as_deref());
        s.push(' ');
        nstring(&mut s, self.subject.as_deref());
        for list in [
            &self.from,
            if self.sender.is_empty() {
                &self.from
            } else {
                &self.sender
            },
            if self.reply_to.is_empty() {
                &self.from
            } else {
                &self.reply_to
            },
            &self.to,
            &self.cc,
            &self.bcc,
        ] {
            s.push(' ');
            address_list(&mut s, list);
        }
        s.push(' ');
        nstring(&mut s, self.in_reply_to.as_deref());
        s.push(' ');
        nstring(&mut s, self.message_id.as_deref());
        s.push(')');
        s
    }
}

fn to_addresses(list: &[MailAddr]) -> Vec<Address> {
    fn single(info: &mailparse::SingleInfo) -> Address {
        let (mailbox, host) = match info.addr.rsplit_once('@') {
            Some((mailbox, host)) => (mailbox.to_owned(), Some(host.to_owned())),
            None => (info.addr.clone(), None),
        };
        Address {
            name: info.display_name.clone().filter(|n| !n.is_empty()),
            mailbox: Some(mailbox),
            host,
        }
    }

    let mut out = Vec::new();
    for addr in list {
        match *addr {
            MailAddr::Single(ref info) => out.push(single(info)),
            MailAddr::Group(ref group) => {
                out.push(Address {
                    name: None,
                    mailbox: Some(group.group_name.clone()),
                    host: None,
                });
                out.extend(group.addrs.iter().map(single));
                out.push(Address::default());
            },
        }
    }
    out
}

fn address_list(s: &mut String, list: &[Address]) {
    if list.is_empty() {
        s.push_str("NIL");
        return;
    }

    s.push('(');
    for addr in list {
        s.push('(');
        nstring(s, addr.name.as_deref());
        s.push_str(" NIL ");
        nstring(s, addr.mailbox.as_deref());
        s.push(' ');
        nstring(s, addr.host.as_deref());
        s.push(')');
    }
    s.push(')');
}

fn nstring(s: &mut String, v: Option<&str>) {
    match v {
        None => s.push_str("NIL"),
        Some(v) => quoted(s, v),
    }
}

fn quoted(s: &mut String, v: &str) {
    s.push('"');
    for ch in v.chars() {
        match ch {
            '"' | '\\' => {
                s.push('\\');
                s.push(ch);
            },
            '\r' | '\n' => s.push(' '),
            ch => s.push(ch),
        }
    }
    s.push('"');
}

fn params(s: &mut String, params: &std::collections::BTreeMap<String, String>) {
    if params.is_empty() {
        s.push_str("NIL");
        return;
    }

    s.push('(');
    for (ix, (k, v)) in params.iter().enumerate() {
        if ix > 0 {
            s.push(' ');
        }
        quoted(s, &k.to_ascii_uppercase());
        s.push(' ');
        quoted(s, v);
    }
    s.push(')');
}

fn disposition(s: &mut String, part: &ParsedMail<'_>) {
    if part.headers.get_first_header("Content-Disposition").is_none() {
        s.push_str("NIL");
        return;
    }

    let disp = part.get_content_disposition();
    let kind = match disp.disposition {
        mailparse::DispositionType::Inline => "inline".to_owned(),
        mailparse::DispositionType::Attachment => "attachment".to_owned(),
        mailparse::DispositionType::Extension(ref e) => e.clone(),
        _ => "inline".to_owned(),
    };
    s.push('(');
    quoted(s, &kind);
    s.push(' ');
    params(s, &disp.params);
    s.push(')');
}

/// Renders the `BODY` (`extended = false`) or `BODYSTRUCTURE` (`extended =
/// true`) of `part`.
fn render_structure(part: &ParsedMail<'_>, extended: bool) -> String {
    let mut s = String::new();
    write_structure(&mut s, part, extended);
    s
}

fn write_structure(s: &mut String, part: &ParsedMail<'_>, extended: bool) {
    let (kind, subtype) = part
        .ctype
        .mimetype
        .split_once('/')
        .unwrap_or(("text", "plain"));

    s.push('(');
    if kind.eq_ignore_ascii_case("multipart") && !part.subparts.is_empty() {
        for sub in &part.subparts {
            write_structure(s, sub, extended);
        }
        s.push(' ');
        quoted(s, &subtype.to_ascii_uppercase());
        if extended {
            s.push(' ');
            params(s, &part.ctype.params);
            s.push(' ');
            disposition(s, part);
            s.push_str(" NIL");
        }
        s.push(')');
        return;
    }

    let (_, body) = header::split_header(part.raw_bytes);
    let text = |name: &str| {
        part.headers
            .get_first_value(name)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    };

    quoted(s, &kind.to_ascii_uppercase());
    s.push(' ');
    quoted(s, &subtype.to_ascii_uppercase());
    s.push(' ');
    params(s, &part.ctype.params);
    s.push(' ');
    nstring(s, text("Content-Id").as_deref());
    s.push(' ');
    nstring(s, text("Content-Description").as_deref());
    s.push(' ');
    quoted(
        s,
        &text("Content-Transfer-Encoding")
            .unwrap_or_else(|| "7bit".to_owned())
            .to_ascii_uppercase(),
    );
    let _ = write!(s, " {}", body.len());

    if kind.eq_ignore_ascii_case("message")
        && subtype.eq_ignore_ascii_case("rfc822")
    {
        if let Ok(inner) = mailparse::parse_mail(body) {
            s.push(' ');
            s.push_str(&Envelope::from_headers(&inner.headers).to_imap());
            s.push(' ');
            write_structure(s, &inner, extended);
            let _ = write!(s, " {}", count_lines(body));
        }
    } else if kind.eq_ignore_ascii_case("text") {
        let _ = write!(s, " {}", count_lines(body));
    }

    if extended {
        s.push_str(" NIL ");
        disposition(s, part);
        s.push_str(" NIL");
    }
    s.push(')');
}

fn count_lines(body: &[u8]) -> usize {
    let newlines = memchr::memchr_iter(b'\n', body).count();
    if body.is_empty() || body.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// Extracts the content of `section` from `literal`.
pub fn fetch_section(literal: &[u8], section: &Section) -> Result<Vec<u8>, Error> {
    if section.part.is_empty() {
        return section_of_message(literal, &section.text);
    }

    // `raw` is always the full text (headers and content) of the current
    // part. Owned copies are needed when descending into encapsulated
    // messages, since `mailparse` borrows from its input.
    let mut raw = literal.to_vec();
    for (depth, &ix) in section.part.iter().enumerate() {
        let mail = mailparse::parse_mail(&raw)?;
        let is_top = 0 == depth;
        let next = if !mail.subparts.is_empty() {
            mail.subparts
                .get((ix as usize).wrapping_sub(1))
                .ok_or(Error::InvalidSectionPart)?
                .raw_bytes
                .to_vec()
        } else if is_message_rfc822(&mail) && !is_top {
            // Part numbers inside an encapsulated message address the
            // message's own parts.
            let (_, body) = header::split_header(mail.raw_bytes);
            let inner = mailparse::parse_mail(body)?;
            if inner.subparts.is_empty() {
                if 1 != ix {
                    return Err(Error::InvalidSectionPart);
                }
                body.to_vec()
            } else {
                inner
                    .subparts
                    .get((ix as usize).wrapping_sub(1))
                    .ok_or(Error::InvalidSectionPart)?
                    .raw_bytes
                    .to_vec()
            }
        } else if 1 == ix {
            // A non-multipart message has a single part 1, itself
            raw.clone()
        } else {
            return Err(Error::InvalidSectionPart);
        };
        raw = next;
    }

    let mail = mailparse::parse_mail(&raw)?;
    let (header, body) = header::split_header(&raw);
    match section.text {
        SectionText::Full => Ok(body.to_vec()),
        SectionText::Mime => Ok(header.to_vec()),
        ref text if is_message_rfc822(&mail) => section_of_message(body, text),
        _ => Err(Error::InvalidSectionPart),
    }
}

fn is_message_rfc822(mail: &ParsedMail<'_>) -> bool {
    mail.ctype.mimetype.eq_ignore_ascii_case("message/rfc822")
}

fn section_of_message(
    message: &[u8],
    text: &SectionText,
) -> Result<Vec<u8>, Error> {
    let (header, body) = header::split_header(message);
    match *text {
        SectionText::Full => Ok(message.to_vec()),
        SectionText::Header => Ok(header.to_vec()),
        SectionText::Text => Ok(body.to_vec()),
        SectionText::HeaderFields { negate, ref fields } => {
            Ok(header::filter_fields(header, fields, negate))
        },
        SectionText::Mime => Err(Error::InvalidSectionPart),
    }
}

/// Returns the decoded text of every textual leaf part of `literal`,
/// concatenated, for body searches.
///
/// If the message can't be parsed, the raw body is returned instead.
pub fn body_text(literal: &[u8]) -> Vec<u8> {
    fn walk(part: &ParsedMail<'_>, out: &mut Vec<u8>) {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                walk(sub, out);
            }
        } else if part.ctype.mimetype.starts_with("text/") {
            match part.get_body() {
                Ok(text) => out.extend_from_slice(text.as_bytes()),
                Err(_) => out.extend_from_slice(
                    header::split_header(part.raw_bytes).1,
                ),
            }
            out.push(b'\n');
        }
    }

    match mailparse::parse_mail(literal) {
        Ok(mail) => {
            let mut out = Vec::new();
            walk(&mail, &mut out);
            out
        },
        Err(_) => header::split_header(literal).1.to_vec(),
    }
}
