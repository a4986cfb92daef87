//! HTTP-Redirect and HTTP-POST binding helpers.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::io::{Read, Write};

/// Largest encoded SAML message we are willing to decode.
pub const MAX_ENCODED_MESSAGE_LEN: usize = 512 * 1024;

/// Deflate and base64 encode for SAML redirect binding.
pub fn deflate_and_encode(xml: &str) -> Result<String> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Decode a base64 message, inflating it when it was deflated.
///
/// Redirect-binding messages are deflated, POST-binding ones are not; both
/// arrive here.
pub fn decode_and_inflate(encoded: &str) -> Result<String> {
    if encoded.len() > MAX_ENCODED_MESSAGE_LEN {
        anyhow::bail!("SAML message too large ({} bytes)", encoded.len());
    }

    // Some IdPs line-wrap the base64 payload
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = BASE64
        .decode(compact.as_bytes())
        .context("Failed to decode SAML message")?;

    let mut inflated = String::new();
    let mut decoder = flate2::read::DeflateDecoder::new(raw.as_slice());
    if decoder.read_to_string(&mut inflated).is_ok() && inflated.trim_start().starts_with('<') {
        return Ok(inflated);
    }

    String::from_utf8(raw).context("SAML message is not valid UTF-8")
}

/// Decode a base64 POST-binding message.
pub fn decode_post(encoded: &str) -> Result<String> {
    if encoded.len() > MAX_ENCODED_MESSAGE_LEN {
        anyhow::bail!("SAML message too large ({} bytes)", encoded.len());
    }

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = BASE64
        .decode(compact.as_bytes())
        .context("Failed to decode SAML response")?;
    String::from_utf8(raw).context("SAML response is not valid UTF-8")
}

/// Build a redirect URL carrying a deflated message under `param`.
pub fn redirect_url(
    location: &str,
    param: &str,
    xml: &str,
    relay_state: Option<&str>,
) -> Result<String> {
    let encoded = deflate_and_encode(xml)?;

    let separator = if location.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}{}={}",
        location,
        separator,
        param,
        urlencoding::encode(&encoded)
    );

    if let Some(state) = relay_state {
        url.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
    }

    Ok(url)
}

/// Fresh message ID. XML IDs must not start with a digit.
pub fn new_message_id() -> String {
    format!("_{}", uuid::Uuid::new_v4().simple())
}

/// Percent-decoded value of `name` in a raw query string.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(&value.replace('+', " ")).ok())
        .map(|value| value.into_owned())
}
