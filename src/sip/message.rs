//! Building responses and in-dialog requests on top of `rsip` types.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use rand::Rng;
use rsip::common::uri::param::Tag;
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Headers, Method, Param, Request, Response, StatusCode, Uri, Version};

pub const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";
pub const USER_AGENT: &str = concat!("voxgate/", env!("CARGO_PKG_VERSION"));

const DEFAULT_SIP_PORT: u16 = 5060;

/// Response to `req` carrying its transaction headers.
///
/// Content-Length is set to zero; [`with_sdp`] replaces it.
pub fn response(req: &Request, status: StatusCode) -> Response {
    let mut headers = Headers::default();
    for header in req.headers.iter() {
        if matches!(
            header,
            Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
        ) {
            headers.push(header.clone());
        }
    }
    headers.push(Header::UserAgent(rsip::headers::UserAgent::new(USER_AGENT)));
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(0u32)));
    Response {
        status_code: status,
        version: Version::V2,
        headers,
        body: Vec::new(),
    }
}

/// Add our dialog tag to the To header unless the request already had one.
pub fn with_to_tag(mut resp: Response, tag: &Tag) -> Response {
    for header in resp.headers.iter_mut() {
        if let Header::To(to) = header {
            if let Ok(mut typed_to) = to.clone().typed() {
                if !typed_to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                    typed_to.params.push(Param::Tag(tag.clone()));
                    *to = typed_to.into();
                }
            }
        }
    }
    resp
}

/// Attach an SDP body.
pub fn with_sdp(mut resp: Response, sdp: &str) -> Response {
    resp.headers
        .push(Header::ContentType(rsip::headers::ContentType::new("application/sdp")));
    resp.headers
        .unique_push(Header::ContentLength(rsip::headers::ContentLength::from(
            sdp.len() as u32,
        )));
    resp.body = sdp.as_bytes().to_vec();
    resp
}

/// Call-ID of a request, if it has one.
pub fn call_id(req: &Request) -> Option<String> {
    req.call_id_header().ok().map(|h| h.value().to_string())
}

/// Raw value of the From or To header, for caller/dialed parsing.
pub fn from_value(req: &Request) -> String {
    req.from_header()
        .map(|h| h.value().to_string())
        .unwrap_or_default()
}

pub fn to_value(req: &Request) -> String {
    req.to_header()
        .map(|h| h.value().to_string())
        .unwrap_or_default()
}

pub fn body_text(req: &Request) -> String {
    String::from_utf8_lossy(&req.body).into_owned()
}

pub fn new_branch() -> String {
    format!("z9hG4bK{:016x}", rand::thread_rng().gen::<u64>())
}

/// Where in-dialog requests to the caller go: its Contact, else its From URI.
pub fn remote_target(invite: &Request) -> Result<Uri> {
    if let Some(contact) = invite.contact_header().ok().and_then(|c| c.typed().ok()) {
        return Ok(contact.uri);
    }
    Ok(invite
        .from_header()
        .context("INVITE has no From header")?
        .typed()
        .context("Unparseable From header")?
        .uri)
}

/// Socket address of a URI whose host is an IP literal.
pub fn uri_addr(uri: &Uri) -> Option<SocketAddr> {
    let host_port = uri.host_with_port.to_string();
    host_port
        .parse()
        .ok()
        .or_else(|| format!("{}:{}", host_port, DEFAULT_SIP_PORT).parse().ok())
}

/// BYE ending the dialog created by `invite` from our side.
pub fn bye(invite: &Request, local_tag: &Tag, via_host: &str, cseq: u32) -> Result<Request> {
    let to = invite
        .to_header()
        .context("INVITE has no To header")?
        .typed()
        .context("Unparseable To header")?;
    let mut params: Vec<Param> = to
        .params
        .into_iter()
        .filter(|p| !matches!(p, Param::Tag(_)))
        .collect();
    params.push(Param::Tag(local_tag.clone()));
    let from = typed::From {
        display_name: to.display_name,
        uri: to.uri,
        params,
    };

    let mut headers = Headers::default();
    headers.push(Header::Via(rsip::headers::Via::new(format!(
        "SIP/2.0/UDP {};branch={}",
        via_host,
        new_branch()
    ))));
    headers.push(Header::MaxForwards(rsip::headers::MaxForwards::from(70u32)));
    headers.push(Header::From(from.into()));
    headers.push(Header::To(rsip::headers::To::new(
        invite.from_header().context("INVITE has no From header")?.value(),
    )));
    headers.push(Header::CallId(
        invite.call_id_header().context("INVITE has no Call-ID")?.clone(),
    ));
    headers.push(Header::CSeq(
        typed::CSeq {
            seq: cseq,
            method: Method::Bye,
        }
        .into(),
    ));
    headers.push(Header::UserAgent(rsip::headers::UserAgent::new(USER_AGENT)));
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(0u32)));

    Ok(Request {
        method: Method::Bye,
        uri: remote_target(invite)?,
        version: Version::V2,
        headers,
        body: Vec::new(),
    })
}
