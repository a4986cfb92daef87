//! Single Logout messages: LogoutRequest and LogoutResponse.

use anyhow::{anyhow, Result};
use chrono::Utc;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use samael::schema::{Issuer, LogoutRequest, LogoutResponse, NameID, Status, StatusCode};
use samael::traits::ToXml;

/// `StatusCode` value for a successful exchange.
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

/// Either kind of logout message arriving at the SLS endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum LogoutMessage {
    Request(LogoutRequest),
    Response(LogoutResponse),
}

/// `Issuer` element for an entity ID.
///
/// samael writes issuer and NameID text verbatim, so values are escaped here.
pub fn issuer(entity_id: &str) -> Issuer {
    Issuer {
        value: Some(escape(entity_id).into_owned()),
        ..Default::default()
    }
}

/// Text of an optional `Issuer` element.
pub fn issuer_value(issuer: &Option<Issuer>) -> Option<&str> {
    issuer.as_ref().and_then(|i| i.value.as_deref())
}

/// LogoutRequest sent by this SP.
pub fn logout_request(
    id: &str,
    issuer_id: &str,
    destination: &str,
    name_id: Option<&str>,
    name_id_format: Option<&str>,
    session_index: Option<&str>,
) -> LogoutRequest {
    LogoutRequest {
        id: Some(id.to_string()),
        version: Some("2.0".to_string()),
        issue_instant: Some(Utc::now()),
        destination: Some(destination.to_string()),
        issuer: Some(issuer(issuer_id)),
        signature: None,
        session_index: session_index.map(str::to_string),
        name_id: name_id.map(|value| NameID {
            format: name_id_format.map(str::to_string),
            value: escape(value).into_owned(),
        }),
    }
}

/// Successful LogoutResponse answering an IdP LogoutRequest.
pub fn logout_response(
    id: &str,
    in_response_to: &str,
    issuer_id: &str,
    destination: &str,
) -> LogoutResponse {
    LogoutResponse {
        id: Some(id.to_string()),
        in_response_to: Some(in_response_to.to_string()),
        version: Some("2.0".to_string()),
        issue_instant: Some(Utc::now()),
        destination: Some(destination.to_string()),
        consent: None,
        issuer: Some(issuer(issuer_id)),
        signature: None,
        status: Some(Status {
            status_code: StatusCode {
                value: Some(STATUS_SUCCESS.to_string()),
            },
            status_message: None,
            status_detail: None,
        }),
    }
}

pub fn request_xml(request: &LogoutRequest) -> Result<String> {
    request
        .to_string()
        .map_err(|e| anyhow!("Failed to serialize LogoutRequest: {}", e))
}

pub fn response_xml(response: &LogoutResponse) -> Result<String> {
    response
        .to_string()
        .map_err(|e| anyhow!("Failed to serialize LogoutResponse: {}", e))
}

/// Top-level `StatusCode` of a LogoutResponse.
pub fn status_code(response: &LogoutResponse) -> Option<&str> {
    response
        .status
        .as_ref()
        .and_then(|s| s.status_code.value.as_deref())
}

pub fn is_success(response: &LogoutResponse) -> bool {
    status_code(response) == Some(STATUS_SUCCESS)
}

/// Local name of the document element.
fn root_element(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader
            .read_event()
            .map_err(|e| anyhow!("Malformed logout message: {}", e))?
        {
            Event::Start(e) | Event::Empty(e) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Event::Eof => return Err(anyhow!("Empty logout message")),
            _ => {}
        }
    }
}

/// Parse a LogoutRequest or LogoutResponse document.
pub fn parse_logout_message(xml: &str) -> Result<LogoutMessage> {
    match root_element(xml)?.as_str() {
        "LogoutRequest" => {
            let request: LogoutRequest = xml
                .parse()
                .map_err(|e| anyhow!("Malformed logout message: {}", e))?;
            if request.id.is_none() {
                return Err(anyhow!("LogoutRequest has no ID"));
            }
            Ok(LogoutMessage::Request(request))
        }
        "LogoutResponse" => {
            let response: LogoutResponse = xml
                .parse()
                .map_err(|e| anyhow!("Malformed logout message: {}", e))?;
            if response.id.is_none() {
                return Err(anyhow!("LogoutResponse has no ID"));
            }
            Ok(LogoutMessage::Response(response))
        }
        other => Err(anyhow!("Unexpected SAML message: {}", other)),
    }
}
