//! Wire-format parsing for SIP messages.
//!
//! Framing per RFC 3261 §7: a request-line or status-line, header lines
//! (with folding), a blank line, and an optional body. The transport is a
//! WebSocket, so one text frame carries exactly one message and
//! Content-Length, when present, must agree with the framed body.

use nom::{
    bytes::complete::{tag, take_while1, take_while_m_n},
    character::complete::char,
    combinator::{eof, map_res, opt, rest},
    sequence::preceded,
    IResult,
};

use crate::error::{Error, Result};
use crate::types::header::{Header, HeaderName};
use crate::types::message::{Message, Request, Response};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn request_line(i: &str) -> IResult<&str, (&str, &str)> {
    let (i, method) = take_while1(is_token_char)(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, uri) = take_while1(|c| c != ' ')(i)?;
    let (i, _) = tag(" SIP/2.0")(i)?;
    let (i, _) = eof(i)?;
    Ok((i, (method, uri)))
}

fn status_line(i: &str) -> IResult<&str, (u16, &str)> {
    let (i, _) = tag("SIP/2.0 ")(i)?;
    let (i, code) = map_res(
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        |s: &str| s.parse::<u16>(),
    )(i)?;
    let (i, reason) = opt(preceded(char(' '), rest))(i)?;
    let (i, _) = eof(i)?;
    Ok((i, (code, reason.unwrap_or(""))))
}

/// Parse one SIP message from a transport frame.
///
/// Fails with [`Error::MalformedStart`], [`Error::MalformedHeader`],
/// [`Error::DuplicateSingletonHeader`] or [`Error::BadContentLength`];
/// the caller discards and logs the frame, the connection stays up.
pub fn parse_message(input: &str) -> Result<Message> {
    let sep = input
        .find("\r\n\r\n")
        .ok_or_else(|| Error::MalformedStart("message has no header/body separator".into()))?;
    let head = &input[..sep];
    let raw_body = &input[sep + 4..];

    let mut lines = head.split("\r\n");
    let start = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::MalformedStart("empty start line".into()))?;

    let headers = parse_headers(lines)?;
    let body = check_body(&headers, raw_body)?;

    if start.starts_with("SIP/2.0") {
        let (_, (code, reason)) = status_line(start)
            .map_err(|_| Error::MalformedStart(format!("bad status line {start:?}")))?;
        Ok(Message::Response(Response {
            status: StatusCode::from_code(code),
            reason: reason.to_string(),
            headers,
            body,
        }))
    } else {
        let (_, (method, uri)) = request_line(start)
            .map_err(|_| Error::MalformedStart(format!("bad request line {start:?}")))?;
        let method: Method = method.parse()?;
        let uri: Uri = uri
            .parse()
            .map_err(|e: Error| Error::MalformedStart(e.to_string()))?;
        Ok(Message::Request(Request {
            method,
            uri,
            headers,
            body,
        }))
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<Header>> {
    // Unfold continuation lines (leading SP / HT) onto their header first.
    let mut logical: Vec<String> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            match logical.last_mut() {
                Some(prev) => {
                    prev.push(' ');
                    prev.push_str(line.trim());
                }
                None => {
                    return Err(Error::MalformedHeader(
                        "continuation line before any header".into(),
                    ))
                }
            }
        } else {
            logical.push(line.to_string());
        }
    }

    let mut headers = Vec::with_capacity(logical.len());
    let mut seen_singletons: Vec<HeaderName> = Vec::new();
    for line in logical {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedHeader(format!("no colon in {line:?}")))?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(is_token_char) {
            return Err(Error::MalformedHeader(format!("bad header name in {line:?}")));
        }
        let name = HeaderName::parse(name);
        if name.is_singleton() {
            if seen_singletons.contains(&name) {
                return Err(Error::DuplicateSingletonHeader(name.as_str().to_string()));
            }
            seen_singletons.push(name.clone());
        }
        headers.push(Header::new(name, value.trim()));
    }
    Ok(headers)
}

fn check_body(headers: &[Header], raw_body: &str) -> Result<String> {
    let declared = headers
        .iter()
        .find(|h| h.name == HeaderName::ContentLength)
        .map(|h| {
            h.value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::MalformedHeader(format!("bad Content-Length {:?}", h.value)))
        })
        .transpose()?;

    match declared {
        Some(declared) if declared != raw_body.len() => Err(Error::BadContentLength {
            declared,
            actual: raw_body.len(),
        }),
        _ => Ok(raw_body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::HeaderAccess;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/WS client.invalid;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@example.com>\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@client.invalid;transport=ws>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\nv=0\n";

    #[test]
    fn parses_request() {
        let msg = parse_message(INVITE).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri.host, "example.com");
        assert_eq!(req.call_id().unwrap(), "a84b4c76e66710");
        assert_eq!(req.cseq().unwrap().seq, 314159);
        assert_eq!(req.body, "v=0\n");
    }

    #[test]
    fn parses_response_with_empty_reason() {
        let wire = "SIP/2.0 200 \r\nCall-ID: x\r\nCSeq: 1 REGISTER\r\n\r\n";
        let msg = parse_message(wire).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.reason, "");
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let msg = parse_message(INVITE).unwrap();
        let reparsed = parse_message(&msg.to_string()).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn folds_continuation_lines() {
        let wire = "OPTIONS sip:a@b.c SIP/2.0\r\n\
            Subject: first part\r\n\
            \tsecond part\r\n\
            Call-ID: y\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let msg = parse_message(wire).unwrap();
        let req = msg.as_request().unwrap();
        let subject = req
            .header_value(&HeaderName::Other("Subject".to_string()))
            .unwrap();
        assert_eq!(subject, "first part second part");
    }

    #[test]
    fn compact_and_mixed_case_names_fold_to_canonical() {
        let wire = "BYE sip:a@b.c SIP/2.0\r\n\
            i: call-7\r\n\
            CSEQ: 2 BYE\r\n\
            v: SIP/2.0/WS h;branch=z9hG4bKx\r\n\r\n";
        let msg = parse_message(wire).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.call_id().unwrap(), "call-7");
        assert_eq!(req.cseq().unwrap().seq, 2);
        assert_eq!(req.via().unwrap().branch(), Some("z9hG4bKx"));
    }

    #[test]
    fn rejects_duplicate_singleton() {
        let wire = "BYE sip:a@b.c SIP/2.0\r\n\
            Call-ID: one\r\n\
            Call-ID: two\r\n\r\n";
        assert_eq!(
            parse_message(wire),
            Err(Error::DuplicateSingletonHeader("Call-ID".to_string()))
        );
    }

    #[test]
    fn rejects_bad_content_length() {
        let wire = "BYE sip:a@b.c SIP/2.0\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(
            parse_message(wire),
            Err(Error::BadContentLength {
                declared: 10,
                actual: 3
            })
        );
    }

    #[test]
    fn rejects_missing_separator_and_garbage_start() {
        assert!(matches!(
            parse_message("INVITE sip:x SIP/2.0\r\nVia: x\r\n"),
            Err(Error::MalformedStart(_))
        ));
        assert!(matches!(
            parse_message("NOT A SIP LINE\r\n\r\n"),
            Err(Error::MalformedStart(_))
        ));
    }

    #[test]
    fn body_without_content_length_is_accepted() {
        let wire = "MESSAGE sip:a@b.c SIP/2.0\r\nCall-ID: z\r\n\r\nhello";
        let msg = parse_message(wire).unwrap();
        assert_eq!(msg.as_request().unwrap().body, "hello");
    }
}
