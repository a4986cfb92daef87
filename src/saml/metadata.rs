//! SP metadata generation and validation.

use anyhow::{anyhow, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use samael::key_info::{KeyInfo, X509Data};
use samael::metadata::{Endpoint, KeyDescriptor, HTTP_REDIRECT_BINDING};
use samael::service_provider::ServiceProvider;
use samael::traits::ToXml;

use super::config::SamlConfig;

/// Strip PEM armour and whitespace, leaving the base64 DER body.
pub fn pem_body(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----"))
        .flat_map(|line| line.chars().filter(|c| !c.is_whitespace()))
        .collect()
}

/// Wrap a base64 DER body in PEM armour.
pub fn pem_certificate(body: &str) -> String {
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Signing `KeyDescriptor` for a base64 DER certificate.
pub fn signing_key(cert_body: &str) -> KeyDescriptor {
    KeyDescriptor {
        key_use: Some("signing".to_string()),
        key_info: KeyInfo {
            id: None,
            x509_data: Some(X509Data {
                certificates: vec![cert_body.to_string()],
            }),
        },
        encryption_methods: None,
    }
}

/// Render the SP `EntityDescriptor`.
///
/// Starts from samael's descriptor and applies what it does not model: the
/// Redirect-binding SLS, the requested NameID format, the configured
/// assertion signing requirement and the optional SP certificate.
pub fn build_sp_metadata(service_provider: &ServiceProvider, config: &SamlConfig) -> Result<String> {
    let mut descriptor = service_provider
        .metadata()
        .map_err(|e| anyhow!("Failed to build SP metadata: {}", e))?;
    descriptor.valid_until = None;

    let cert = config
        .sp
        .x509cert
        .as_deref()
        .map(pem_body)
        .filter(|cert| !cert.is_empty());

    for sp in descriptor.sp_sso_descriptors.iter_mut().flatten() {
        sp.valid_until = None;
        sp.want_assertions_signed = Some(config.security.want_assertions_signed);
        sp.key_descriptors = cert.as_deref().map(|cert| vec![signing_key(cert)]);
        sp.single_logout_services = Some(vec![Endpoint {
            binding: HTTP_REDIRECT_BINDING.to_string(),
            location: config.sls_url(),
            response_location: None,
        }]);
        sp.name_id_formats = Some(vec![config.sp.name_id_format.clone()]);
        for acs in sp.assertion_consumer_services.iter_mut() {
            acs.index = 1;
        }
    }

    descriptor
        .to_string()
        .map_err(|e| anyhow!("Failed to serialize SP metadata: {}", e))
}

/// Structural checks on SP metadata. Returns one message per problem.
pub fn validate_metadata(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut errors = Vec::new();
    let mut saw_root = false;
    let mut saw_sp_descriptor = false;
    let mut saw_acs = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match local.as_str() {
                    "EntityDescriptor" => {
                        saw_root = true;
                        let entity_id = e.attributes().flatten().find_map(|attr| {
                            (attr.key.local_name().as_ref() == b"entityID")
                                .then(|| String::from_utf8_lossy(&attr.value).to_string())
                        });
                        if entity_id.map_or(true, |id| id.trim().is_empty()) {
                            errors.push("entityID_not_found".to_string());
                        }
                    }
                    "SPSSODescriptor" => saw_sp_descriptor = true,
                    "AssertionConsumerService" => saw_acs = true,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                errors.push(format!("invalid_xml: {}", e));
                return errors;
            }
            _ => {}
        }
    }

    if !saw_root {
        errors.push("noEntityDescriptor_xml".to_string());
    }
    if !saw_sp_descriptor {
        errors.push("onlySPSSODescriptor_allowed_xml".to_string());
    }
    if !saw_acs {
        errors.push("noAssertionConsumerService_xml".to_string());
    }

    errors
}
