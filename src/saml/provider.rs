//! SAML Service Provider implementation.
//!
//! Builds outbound AuthnRequests and LogoutRequests, and validates the
//! Responses and logout messages the IdP sends back. Signatures are checked
//! against the configured IdP certificate.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use quick_xml::escape::escape;
use samael::crypto::{decode_x509_cert, verify_signed_xml, UrlVerifier};
use samael::metadata::{Endpoint, EntityDescriptor, IdpSsoDescriptor, HTTP_REDIRECT_BINDING};
use samael::schema::Response;
use samael::service_provider::{ServiceProvider, ServiceProviderBuilder};
use samael::signature::{Signature, SignatureAlgorithm};
use samael::traits::ToXml;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::binding::{decode_and_inflate, decode_post, new_message_id, query_param, redirect_url};
use super::config::SamlConfig;
use super::logout::{
    is_success, issuer_value, logout_request, logout_response, parse_logout_message,
    request_xml, response_xml, status_code, LogoutMessage, STATUS_SUCCESS,
};
use super::metadata::{build_sp_metadata, pem_body, pem_certificate, signing_key, validate_metadata};

const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";

/// SAML Service Provider bound to one IdP.
pub struct SamlProvider {
    config: SamlConfig,
    service_provider: ServiceProvider,
    idp_cert_der: Vec<u8>,
    idp_url_verifier: UrlVerifier,
}

/// A redirect-binding message ready to send the browser to.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Message ID, to be matched against `InResponseTo` later.
    pub id: String,
    /// Full redirect URL.
    pub url: String,
}

/// Result of processing a SAML assertion.
#[derive(Debug, Clone)]
pub struct ProcessedAssertion {
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub assertion_id: String,
    pub idp_entity_id: String,
    pub session_index: Option<String>,
    pub attributes: HashMap<String, Vec<String>>,
    /// When the assertion stops being valid; bounds replay tracking.
    pub not_on_or_after: Option<DateTime<Utc>>,
}

/// Encoded message arriving at the SLS endpoint.
#[derive(Debug, Clone)]
pub enum SloMessage {
    /// `SAMLResponse` parameter: answer to our LogoutRequest.
    Response(String),
    /// `SAMLRequest` parameter: IdP-initiated logout.
    Request(String),
}

/// A logout message that could not be decoded or parsed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MalformedMessage(pub String);

/// What the SLS endpoint should do after a valid logout message.
#[derive(Debug, Clone)]
pub enum SloOutcome {
    /// Our logout round-trip completed.
    LoggedOut,
    /// The IdP asked us to log out a subject; send it this response.
    RespondToIdp { url: String, name_id: Option<String> },
}

/// IdP description samael validates responses against.
fn idp_metadata(config: &SamlConfig, cert_body: &str) -> EntityDescriptor {
    let endpoint = |location: &str| Endpoint {
        binding: HTTP_REDIRECT_BINDING.to_string(),
        location: location.to_string(),
        response_location: None,
    };

    EntityDescriptor {
        entity_id: Some(config.idp.entity_id.clone()),
        idp_sso_descriptors: Some(vec![IdpSsoDescriptor {
            id: None,
            valid_until: None,
            cache_duration: None,
            protocol_support_enumeration: Some(PROTOCOL_NS.to_string()),
            error_url: None,
            signature: None,
            key_descriptors: vec![signing_key(cert_body)],
            organization: None,
            contact_people: vec![],
            artifact_resolution_service: vec![],
            single_logout_services: config.idp.slo_url.as_deref().map(endpoint).into_iter().collect(),
            manage_name_id_services: vec![],
            name_id_formats: vec![],
            want_authn_requests_signed: None,
            single_sign_on_services: vec![endpoint(&config.idp.sso_url)],
            name_id_mapping_services: vec![],
            assertion_id_request_services: vec![],
            attribute_profiles: vec![],
            attributes: vec![],
        }]),
        ..Default::default()
    }
}

/// Whether `signature` covers the element with the given ID.
fn signs(signature: Option<&Signature>, id: &str) -> bool {
    let target = format!("#{}", id);
    signature.map_or(false, |s| {
        s.signed_info
            .reference
            .iter()
            .any(|r| r.uri.as_deref() == Some(target.as_str()))
    })
}

impl SamlProvider {
    /// Create a new SAML provider with the given configuration.
    pub fn new(config: SamlConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let cert_body = config.idp.x509cert.as_deref().map(pem_body).unwrap_or_default();
        let idp_cert_der =
            decode_x509_cert(&cert_body).context("idp.x509cert is not valid base64")?;
        let idp_url_verifier = UrlVerifier::from_x509_cert_pem(&pem_certificate(&cert_body))
            .map_err(|e| anyhow!("idp.x509cert is not a valid certificate: {}", e))?;

        let skew = Duration::seconds(config.security.clock_skew_secs);
        let service_provider = ServiceProviderBuilder::default()
            .entity_id(config.sp_entity_id())
            .acs_url(config.acs_url())
            .slo_url(config.sls_url())
            .idp_metadata(idp_metadata(&config, &cert_body))
            .authn_name_id_format(config.sp.name_id_format.clone())
            .force_authn(config.force_authn())
            .allow_idp_initiated(true)
            .max_issue_delay(skew)
            .max_clock_skew(skew)
            .build()
            .context("Failed to configure the SAML service provider")?;

        Ok(Self {
            config,
            service_provider,
            idp_cert_der,
            idp_url_verifier,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &SamlConfig {
        &self.config
    }

    /// SP metadata XML, checked before it is handed out.
    pub fn metadata(&self) -> Result<String> {
        let xml = build_sp_metadata(&self.service_provider, &self.config)?;
        let errors = validate_metadata(&xml);
        if !errors.is_empty() {
            return Err(anyhow!("Invalid SP metadata: {}", errors.join(", ")));
        }
        Ok(xml)
    }

    /// Create an AuthnRequest and return the redirect to the IdP.
    pub fn login_redirect(
        &self,
        return_to: Option<&str>,
        force_authn: bool,
        is_passive: bool,
    ) -> Result<OutboundRequest> {
        let sso_url = self
            .service_provider
            .sso_binding_location(HTTP_REDIRECT_BINDING)
            .ok_or_else(|| anyhow!("IdP has no HTTP-Redirect SSO endpoint"))?;

        let mut request = self
            .service_provider
            .make_authentication_request(&sso_url)
            .map_err(|e| anyhow!("Failed to build AuthnRequest: {}", e))?;
        request.id = new_message_id();
        request.force_authn = force_authn.then_some(true);
        request.is_passive = is_passive.then_some(true);
        if let Some(issuer) = request.issuer.as_mut() {
            issuer.value = issuer.value.as_deref().map(|v| escape(v).into_owned());
        }

        let xml = request
            .to_string()
            .map_err(|e| anyhow!("Failed to serialize AuthnRequest: {}", e))?;
        let url = redirect_url(&sso_url, "SAMLRequest", &xml, return_to)?;

        debug!(request_id = %request.id, force_authn, "Created SAML AuthnRequest redirect");
        Ok(OutboundRequest {
            id: request.id,
            url,
        })
    }

    /// Process a SAML Response from the IdP ACS POST.
    ///
    /// `request_id` is the pending AuthnRequest ID, if we sent one. The
    /// response must carry a signature by the IdP certificate, on the
    /// Response, the Assertion or both.
    pub fn process_response(
        &self,
        saml_response: &str,
        request_id: Option<&str>,
    ) -> Result<ProcessedAssertion> {
        let config = &self.config;
        let response_xml = decode_post(saml_response)?;

        debug!("Processing SAML response");

        let response: Response = response_xml
            .parse()
            .map_err(|e| anyhow!("Failed to parse SAML response: {}", e))?;

        if let Some(ref status) = response.status {
            let status_value = status.status_code.value.as_deref();
            if status_value != Some(STATUS_SUCCESS) {
                let message = status
                    .status_message
                    .as_ref()
                    .and_then(|m| m.value.clone())
                    .or_else(|| status_value.map(str::to_string))
                    .unwrap_or_else(|| "Unknown error".to_string());
                return Err(anyhow!("SAML authentication failed: {}", message));
            }
        }

        // A missing InResponseTo is an IdP-initiated login, even while an
        // AuthnRequest of ours is pending.
        match (request_id, response.in_response_to.as_deref()) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(anyhow!(
                    "The InResponseTo of the Response: {}, does not match the ID of the AuthNRequest sent by the SP: {}",
                    actual,
                    expected
                ));
            }
            (None, Some(actual)) if config.security.reject_unsolicited_responses => {
                return Err(anyhow!(
                    "The Response answers {} but no AuthNRequest is pending",
                    actual
                ));
            }
            (_, None) if config.security.reject_unsolicited_responses => {
                return Err(anyhow!("Unsolicited SAML responses are not accepted"));
            }
            _ => {}
        }

        let assertion_signature = response.assertion.as_ref().and_then(|a| a.signature.as_ref());
        if response.signature.is_none() && assertion_signature.is_none() {
            return Err(anyhow!("The SAML Response is not signed"));
        }

        let possible_ids: Vec<&str> = request_id.into_iter().collect();
        let assertion = self
            .service_provider
            .parse_xml_response(&response_xml, Some(possible_ids.as_slice()))?;

        if config.security.want_messages_signed && !signs(response.signature.as_ref(), &response.id)
        {
            return Err(anyhow!("The Message of the Response is not signed and the SP requires it"));
        }
        if config.security.want_assertions_signed
            && !signs(assertion.signature.as_ref(), &assertion.id)
        {
            return Err(anyhow!("The Assertion of the Response is not signed and the SP requires it"));
        }

        let idp_entity_id = assertion
            .issuer
            .value
            .clone()
            .unwrap_or_else(|| config.idp.entity_id.clone());

        let skew = Duration::seconds(config.security.clock_skew_secs);
        let not_on_or_after = assertion
            .conditions
            .as_ref()
            .and_then(|c| c.not_on_or_after)
            .map(|expiry| expiry + skew);

        let subject = assertion
            .subject
            .as_ref()
            .ok_or_else(|| anyhow!("SAML assertion missing subject"))?;

        let name_id = subject
            .name_id
            .as_ref()
            .ok_or_else(|| anyhow!("SAML assertion missing NameID"))?;

        let session_index = assertion
            .authn_statements
            .as_ref()
            .and_then(|stmts| stmts.first())
            .and_then(|s| s.session_index.clone());

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();

        if let Some(ref attr_statements) = assertion.attribute_statements {
            for attr_statement in attr_statements {
                for attr in &attr_statement.attributes {
                    if let Some(ref name) = attr.name {
                        let values = attr.values.iter().filter_map(|v| v.value.clone());
                        attributes.entry(name.clone()).or_default().extend(values);
                    }
                }
            }
        }

        info!(
            name_id = %name_id.value,
            idp = %idp_entity_id,
            attributes = attributes.len(),
            "SAML assertion validated"
        );

        Ok(ProcessedAssertion {
            name_id: name_id.value.clone(),
            name_id_format: name_id.format.clone(),
            assertion_id: assertion.id.clone(),
            idp_entity_id,
            session_index,
            attributes,
            not_on_or_after,
        })
    }

    /// Create a LogoutRequest and return the redirect to the IdP.
    ///
    /// Returns `None` when the IdP has no Single Logout endpoint. Without a
    /// `name_id` the request carries no subject.
    pub fn logout_redirect(
        &self,
        return_to: Option<&str>,
        name_id: Option<&str>,
        session_index: Option<&str>,
        name_id_format: Option<&str>,
    ) -> Result<Option<OutboundRequest>> {
        let config = &self.config;
        let Some(slo_url) = self.service_provider.slo_binding_location(HTTP_REDIRECT_BINDING)
        else {
            return Ok(None);
        };

        let id = new_message_id();
        let request = logout_request(
            &id,
            &config.sp_entity_id(),
            &slo_url,
            name_id,
            name_id_format.or(Some(config.sp.name_id_format.as_str())),
            session_index,
        );

        let url = redirect_url(&slo_url, "SAMLRequest", &request_xml(&request)?, return_to)?;

        debug!(request_id = %id, "Created SAML LogoutRequest redirect");
        Ok(Some(OutboundRequest { id, url }))
    }

    /// Validate a logout message received at the SLS endpoint.
    ///
    /// `request_id` is the pending LogoutRequest ID, if we sent one.
    /// `raw_query` is the undecoded query string of a Redirect-binding
    /// message, used to check its detached signature.
    pub fn process_slo(
        &self,
        message: &SloMessage,
        request_id: Option<&str>,
        relay_state: Option<&str>,
        raw_query: Option<&str>,
    ) -> Result<SloOutcome> {
        let config = &self.config;

        let (encoded, expect_request) = match message {
            SloMessage::Response(encoded) => (encoded, false),
            SloMessage::Request(encoded) => (encoded, true),
        };
        let xml = decode_and_inflate(encoded).map_err(|e| MalformedMessage(format!("{:#}", e)))?;
        let parsed = parse_logout_message(&xml).map_err(|e| MalformedMessage(e.to_string()))?;

        match (parsed, expect_request) {
            (LogoutMessage::Response(response), false) => {
                let response_id = response.id.clone().unwrap_or_default();
                self.check_issuer(issuer_value(&response.issuer))?;

                let signed = self.verify_logout_signature(
                    &xml,
                    response.signature.as_ref(),
                    &response_id,
                    false,
                    raw_query,
                )?;
                if config.security.want_messages_signed && !signed {
                    return Err(anyhow!(
                        "The Logout Response is not signed and the SP requires it"
                    ));
                }

                match (request_id, response.in_response_to.as_deref()) {
                    (Some(expected), Some(actual)) if expected != actual => {
                        return Err(anyhow!(
                            "The InResponseTo of the Logout Response: {}, does not match the ID of the Logout request sent by the SP: {}",
                            actual,
                            expected
                        ));
                    }
                    (Some(expected), None) => {
                        return Err(anyhow!(
                            "The Logout Response has no InResponseTo but Logout request {} is pending",
                            expected
                        ));
                    }
                    _ => {}
                }

                if !is_success(&response) {
                    let reason = status_code(&response).unwrap_or("no status");
                    return Err(anyhow!("Logout failed at the IdP: {}", reason));
                }

                info!(response_id = %response_id, "SAML logout completed");
                Ok(SloOutcome::LoggedOut)
            }
            (LogoutMessage::Request(request), true) => {
                let idp_request_id = request.id.clone().unwrap_or_default();

                let issuer = issuer_value(&request.issuer)
                    .ok_or_else(|| anyhow!("The Logout Request has no Issuer"))?;
                self.check_issuer(Some(issuer))?;

                let signed = self.verify_logout_signature(
                    &xml,
                    request.signature.as_ref(),
                    &idp_request_id,
                    true,
                    raw_query,
                )?;
                if !signed {
                    return Err(anyhow!("The Logout Request is not signed"));
                }

                let destination = config
                    .idp_slo_response_url()
                    .ok_or_else(|| anyhow!("IdP Single Logout URL not configured"))?
                    .to_string();

                let response = logout_response(
                    &new_message_id(),
                    &idp_request_id,
                    &config.sp_entity_id(),
                    &destination,
                );
                let url = redirect_url(
                    &destination,
                    "SAMLResponse",
                    &response_xml(&response)?,
                    relay_state,
                )?;

                let name_id = request.name_id.map(|n| n.value);
                info!(
                    request_id = %idp_request_id,
                    name_id = name_id.as_deref().unwrap_or_default(),
                    "IdP-initiated SAML logout"
                );
                Ok(SloOutcome::RespondToIdp { url, name_id })
            }
            (LogoutMessage::Request(_), false) => {
                Err(anyhow!("SAMLResponse parameter carries a LogoutRequest"))
            }
            (LogoutMessage::Response(_), true) => {
                Err(anyhow!("SAMLRequest parameter carries a LogoutResponse"))
            }
        }
    }

    /// Check the IdP signature on a logout message.
    ///
    /// Redirect-binding messages are signed over the query string, others
    /// embed an enveloped XML signature. Returns `false` for an unsigned
    /// message and an error for a bad signature.
    fn verify_logout_signature(
        &self,
        xml: &str,
        signature: Option<&Signature>,
        message_id: &str,
        is_request: bool,
        raw_query: Option<&str>,
    ) -> Result<bool> {
        if let Some(query) = raw_query.filter(|q| query_param(q, "Signature").is_some()) {
            let sig_alg = query_param(query, "SigAlg")
                .ok_or_else(|| anyhow!("Signed logout message has no SigAlg"))?;
            match sig_alg.parse::<SignatureAlgorithm>() {
                Ok(SignatureAlgorithm::RsaSha256) | Ok(SignatureAlgorithm::EcdsaSha256) => {}
                _ => return Err(anyhow!("Unsupported logout signature algorithm: {}", sig_alg)),
            }

            let uri = format!("/?{}", query);
            let verified = if is_request {
                self.idp_url_verifier.verify_percent_encoded_request_uri_string(&uri)
            } else {
                self.idp_url_verifier.verify_percent_encoded_response_uri_string(&uri)
            }
            .map_err(|e| anyhow!("Signature validation failed. Logout message rejected: {}", e))?;

            if !verified {
                warn!(message_id = %message_id, "Logout message query signature does not verify");
                return Err(anyhow!("Signature validation failed. Logout message rejected"));
            }
            return Ok(true);
        }

        match signature {
            None => Ok(false),
            Some(signature) => {
                if !signs(Some(signature), message_id) {
                    return Err(anyhow!(
                        "The logout message signature does not reference message {}",
                        message_id
                    ));
                }
                verify_signed_xml(xml, &self.idp_cert_der, Some("ID")).map_err(|e| {
                    anyhow!("Signature validation failed. Logout message rejected: {}", e)
                })?;
                Ok(true)
            }
        }
    }

    fn check_issuer(&self, issuer: Option<&str>) -> Result<()> {
        match issuer {
            Some(issuer) if issuer != self.config.idp.entity_id => {
                Err(anyhow!("Invalid issuer in the Logout message: {}", issuer))
            }
            _ => Ok(()),
        }
    }
}
