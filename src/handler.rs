//! SAML endpoint dispatcher.
//!
//! Routes `auth/saml/{endpoint}` requests to the provider and turns the
//! outcome into session updates and browser redirects.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{any, get},
    Form, Json, Router,
};
use chrono::{Duration, Utc};
use quick_xml::escape::escape;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::authz::{authorize_user_and_groups, AuthController};
use crate::error::{EndpointError, EndpointResult};
use crate::mapping::map_saml_attrs;
use crate::saml::{MalformedMessage, SamlConfig, SamlProvider, SloMessage, SloOutcome};
use crate::session::{SamlSessionData, Session, SessionId, SessionStore};

/// Parameters of the HTTP-Redirect and HTTP-POST bindings.
#[derive(Debug, Default, Deserialize)]
pub struct SamlParams {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "SAMLRequest")]
    pub saml_request: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// SAML authentication handler shared by all routes.
#[derive(Clone)]
pub struct SamlAuth {
    provider: Arc<SamlProvider>,
    store: Arc<SessionStore>,
    controller: Arc<dyn AuthController>,
}

impl SamlAuth {
    pub fn new(
        provider: Arc<SamlProvider>,
        store: Arc<SessionStore>,
        controller: Arc<dyn AuthController>,
    ) -> Self {
        Self {
            provider,
            store,
            controller,
        }
    }

    fn config(&self) -> &SamlConfig {
        self.provider.config()
    }

    /// Build the router serving the SAML and login endpoints.
    pub fn router(self) -> Router {
        Router::new()
            .route("/auth/saml/:endpoint", get(saml_get).post(saml_post))
            .route("/auth/login", any(login))
            .route("/auth/session", get(session_info))
            .with_state(self)
    }

    /// Dispatch a request for `auth/saml/{endpoint}`.
    ///
    /// `raw_query` is the undecoded query string of a GET request.
    pub fn handle(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        params: SamlParams,
        raw_query: Option<&str>,
    ) -> EndpointResult<Response> {
        debug!(endpoint = %endpoint, "SAML endpoint requested");

        match endpoint {
            "metadata" => self.metadata(),
            "sso" => self.sso(headers),
            "slo" => self.slo(headers),
            "acs" => self.acs(headers, params),
            "sls" => self.sls(headers, params, raw_query),
            other => Err(EndpointError::UnknownEndpoint(other.to_string())),
        }
    }

    /// Password logins are not accepted; every login goes through the IdP.
    pub fn login(&self) -> Response {
        redirect(&self.config().sso_url(), None)
    }

    fn metadata(&self) -> EndpointResult<Response> {
        let xml = self
            .provider
            .metadata()
            .map_err(|e| EndpointError::InvalidMetadata(e.to_string()))?;

        Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], xml).into_response())
    }

    fn sso(&self, headers: &HeaderMap) -> EndpointResult<Response> {
        let config = self.config();
        let mut session = self.load_or_start(headers)?;

        let request = self
            .provider
            .login_redirect(None, config.force_authn(), false)?;

        session.authn_request_id = Some(request.id.clone());
        self.store.save(&session)?;

        info!(
            session_id = %session.id,
            request_id = %request.id,
            "Redirecting to IdP for SAML login"
        );
        Ok(redirect(
            &request.url,
            Some(config.build_cookie(&session.id.to_hex())),
        ))
    }

    fn acs(&self, headers: &HeaderMap, params: SamlParams) -> EndpointResult<Response> {
        let config = self.config();

        let saml_response = params.saml_response.ok_or_else(|| {
            EndpointError::NotAuthenticated(vec!["SAML Response not found".to_string()])
        })?;

        let previous = self.load(headers)?;
        let request_id = previous.as_ref().and_then(|s| s.authn_request_id.clone());

        let assertion = match self
            .provider
            .process_response(&saml_response, request_id.as_deref())
        {
            Ok(assertion) => assertion,
            Err(e) => {
                warn!(error = %e, "SAML response rejected");
                if let Some(mut session) = previous.filter(|s| s.authn_request_id.is_some()) {
                    session.authn_request_id = None;
                    self.store.save(&session)?;
                }
                return Err(EndpointError::NotAuthenticated(vec![e.to_string()]));
            }
        };

        if self.store.is_assertion_used(&assertion.assertion_id)? {
            warn!(assertion_id = %assertion.assertion_id, "SAML assertion replay detected");
            return Err(EndpointError::NotAuthenticated(vec![
                "SAML assertion replay detected".to_string(),
            ]));
        }
        let replay_until = assertion
            .not_on_or_after
            .unwrap_or_else(|| Utc::now() + Duration::seconds(self.store.default_ttl_secs() as i64));
        self.store
            .mark_assertion_used(&assertion.assertion_id, replay_until)?;

        let mapped = map_saml_attrs(config, &assertion.attributes);

        // A new login never inherits the pre-login session.
        if let Some(ref old) = previous {
            self.store.delete(old.id)?;
        }
        let auth_data = mapped?;

        let mut session = self.store.start()?;
        let cookie = config.build_cookie(&session.id.to_hex());
        debug!(
            session_id = %session.id,
            previous = ?previous.as_ref().map(|s| s.id.to_hex()),
            "Session rotated for SAML login"
        );

        session.saml = Some(SamlSessionData {
            attributes: assertion.attributes,
            name_id: assertion.name_id,
            name_id_format: assertion.name_id_format,
            session_index: assertion.session_index,
            idp_entity_id: assertion.idp_entity_id,
        });

        let allowed = auth_data.user.is_some()
            && authorize_user_and_groups(
                &config.authz,
                auth_data.user.as_deref(),
                &auth_data.groups,
            );

        if !allowed {
            if auth_data.user.is_none() {
                warn!(session_id = %session.id, "No user found in SAML attributes");
            } else {
                warn!(
                    user = auth_data.user.as_deref().unwrap_or_default(),
                    groups = ?auth_data.groups,
                    "User is not authorized"
                );
            }
            self.store.save(&session)?;
            return Ok(redirect(&config.url(&config.unauthorized_path), Some(cookie)));
        }

        debug!(extra = ?auth_data.extra, "Additional mapped attributes");
        self.controller.store_auth_data(&mut session, &auth_data)?;
        self.controller.set_session_props(&mut session)?;
        self.store.save(&session)?;

        info!(
            session_id = %session.id,
            user = session.user.as_deref().unwrap_or_default(),
            "SAML login successful"
        );
        Ok(redirect(&config.url(&config.dashboard_path), Some(cookie)))
    }

    fn slo(&self, headers: &HeaderMap) -> EndpointResult<Response> {
        let config = self.config();
        let session = self.load(headers)?;

        let Some(mut session) = session else {
            if config.disable_sso {
                return Ok(self.logout_view());
            }
            // No local session left, but the IdP may still hold one.
            return match self
                .provider
                .logout_redirect(Some(&config.sls_url()), None, None, None)?
            {
                Some(request) => {
                    info!(request_id = %request.id, "Redirecting to IdP for SAML logout without a session");
                    Ok(redirect(&request.url, None))
                }
                None => Ok(self.logout_view()),
            };
        };

        if config.disable_sso {
            self.store.delete(session.id)?;
            info!(session_id = %session.id, "Local logout");
            return Ok(self.logout_view());
        }

        let (name_id, name_id_format, session_index) = match session.saml {
            Some(ref saml) => (
                Some(saml.name_id.clone()),
                saml.name_id_format.clone(),
                saml.session_index.clone(),
            ),
            None => (None, None, None),
        };

        let request = self.provider.logout_redirect(
            Some(&config.sls_url()),
            name_id.as_deref(),
            session_index.as_deref(),
            name_id_format.as_deref(),
        )?;

        match request {
            Some(request) => {
                session.logout_request_id = Some(request.id.clone());
                self.store.save(&session)?;

                info!(
                    session_id = %session.id,
                    request_id = %request.id,
                    "Redirecting to IdP for SAML logout"
                );
                Ok(redirect(&request.url, None))
            }
            None => {
                self.store.delete(session.id)?;
                info!(session_id = %session.id, "IdP has no Single Logout endpoint, local logout only");
                Ok(self.logout_view())
            }
        }
    }

    fn sls(
        &self,
        headers: &HeaderMap,
        params: SamlParams,
        raw_query: Option<&str>,
    ) -> EndpointResult<Response> {
        let message = match (params.saml_response, params.saml_request) {
            (Some(response), _) => SloMessage::Response(response),
            (None, Some(request)) => SloMessage::Request(request),
            (None, None) => {
                return Err(EndpointError::MalformedLogout(
                    "SAML LogoutRequest/LogoutResponse not found".to_string(),
                ))
            }
        };

        let session = self.load(headers)?;
        let request_id = session
            .as_ref()
            .and_then(|s| s.logout_request_id.as_deref());

        let outcome = self
            .provider
            .process_slo(&message, request_id, params.relay_state.as_deref(), raw_query)
            .map_err(|e| {
                warn!(error = %e, "SAML logout message rejected");
                if e.is::<MalformedMessage>() {
                    EndpointError::MalformedLogout(e.to_string())
                } else {
                    EndpointError::LogoutRejected(vec![e.to_string()])
                }
            })?;

        if let Some(ref session) = session {
            self.store.delete(session.id)?;
        }

        match outcome {
            SloOutcome::LoggedOut => Ok(self.logout_view()),
            SloOutcome::RespondToIdp { url, name_id } => {
                if let Some(ref name_id) = name_id {
                    let removed = self.store.delete_by_name_id(name_id)?;
                    info!(name_id = %name_id, removed, "Sessions ended by IdP logout");
                }
                Ok(redirect(&url, Some(self.config().clear_cookie())))
            }
        }
    }

    fn session_id(&self, headers: &HeaderMap) -> Option<SessionId> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookies| self.config().parse_session_cookie(cookies))
            .and_then(|value| SessionId::from_hex(&value))
    }

    fn load(&self, headers: &HeaderMap) -> EndpointResult<Option<Session>> {
        match self.session_id(headers) {
            Some(id) => Ok(self.store.get(id)?),
            None => Ok(None),
        }
    }

    fn load_or_start(&self, headers: &HeaderMap) -> EndpointResult<Session> {
        match self.load(headers)? {
            Some(session) => Ok(session),
            None => Ok(self.store.start()?),
        }
    }

    fn logout_view(&self) -> Response {
        let config = self.config();
        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head><title>Logged out</title></head>
<body>
<p>You have been logged out.</p>
<p><a href="{}">Log in again</a></p>
</body>
</html>"#,
            escape(&config.url(""))
        );
        with_cookie((StatusCode::OK, Html(body)).into_response(), &config.clear_cookie())
    }
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

fn redirect(location: &str, cookie: Option<String>) -> Response {
    let response = (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response();
    match cookie {
        Some(cookie) => with_cookie(response, &cookie),
        None => response,
    }
}

async fn saml_get(
    State(auth): State<SamlAuth>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<SamlParams>,
) -> EndpointResult<Response> {
    auth.handle(&endpoint, &headers, params, raw_query.as_deref())
}

async fn saml_post(
    State(auth): State<SamlAuth>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    Form(params): Form<SamlParams>,
) -> EndpointResult<Response> {
    auth.handle(&endpoint, &headers, params, None)
}

async fn login(State(auth): State<SamlAuth>) -> Response {
    auth.login()
}

async fn session_info(State(auth): State<SamlAuth>, headers: HeaderMap) -> EndpointResult<Response> {
    let session = auth.load(&headers)?;

    let body = match session {
        Some(session) => serde_json::json!({
            "authenticated": session.is_authenticated(),
            "user": session.user,
            "groups": session.groups,
            "role": session.role,
            "auth": session.auth,
            "name_id": session.name_id(),
            "expires_at": session.expires_at,
        }),
        None => serde_json::json!({ "authenticated": false }),
    };

    Ok(Json(body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{RoleRule, SessionAuthController, StringList};
    use crate::saml::provider::tests::{
        encoded_logout_request, encoded_logout_response, encoded_response,
        encoded_unsigned_logout_request, query_signed_logout_request, test_config,
        ResponseFixture, Signing,
    };
    use crate::saml::logout::STATUS_SUCCESS;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        _dir: TempDir,
        auth: SamlAuth,
        store: Arc<SessionStore>,
    }

    fn harness(config: SamlConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path().join("sessions.redb"), 3600).unwrap());
        let controller = Arc::new(SessionAuthController::new(config.authz.clone()));
        let provider = Arc::new(SamlProvider::new(config).unwrap());
        let auth = SamlAuth::new(provider, store.clone(), controller);
        Harness {
            _dir: dir,
            auth,
            store,
        }
    }

    fn config() -> SamlConfig {
        let mut config = test_config();
        config.authz.roles = vec![RoleRule {
            role: "admin".to_string(),
            members: vec!["@admins".to_string()],
        }];
        config
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_form(uri: &str, cookie: Option<&str>, form: &[(&str, &str)]) -> Request<Body> {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn location(response: &Response) -> &str {
        response.headers()[header::LOCATION].to_str().unwrap()
    }

    /// `name=value` pair from the response's session cookie.
    fn session_cookie(response: &Response) -> String {
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    fn session_of_opt(h: &Harness, cookie: &str) -> Option<Session> {
        let id = cookie.split('=').nth(1).unwrap();
        h.store.get(SessionId::from_hex(id).unwrap()).unwrap()
    }

    fn session_of(h: &Harness, cookie: &str) -> Session {
        session_of_opt(h, cookie).unwrap()
    }

    /// Run the SSO redirect and return the session cookie and request ID.
    async fn start_sso(h: &Harness) -> (String, String) {
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/sso", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/sso?SAMLRequest="));

        let cookie = session_cookie(&response);
        let request_id = session_of(h, &cookie).authn_request_id.unwrap();
        (cookie, request_id)
    }

    /// Complete an SP-initiated login and return the post-login session cookie.
    async fn login_user(h: &Harness, assertion_id: &str, groups: &[&str]) -> String {
        let (cookie, request_id) = start_sso(h).await;
        let response = encoded_response(
            Some(&request_id),
            assertion_id,
            "jdoe@example.com",
            &[("User.email", &["jdoe@example.com"]), ("memberOf", groups)],
        );

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                Some(&cookie),
                &[("SAMLResponse", &response)],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://reports.example.com/show/dashboard"
        );
        session_cookie(&response)
    }

    async fn post_acs(h: &Harness, cookie: Option<&str>, saml_response: &str) -> Response {
        h.auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                cookie,
                &[("SAMLResponse", saml_response)],
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_metadata_endpoint() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/metadata", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");
        assert!(body_string(response).await.contains("EntityDescriptor"));
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/bogus", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Unknown endpoint: bogus");
    }

    #[tokio::test]
    async fn test_login_redirects_to_sso() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/login",
                None,
                &[("login", "jdoe"), ("password", "secret")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://reports.example.com/auth/saml/sso"
        );
    }

    #[tokio::test]
    async fn test_acs_logs_user_in() {
        let h = harness(config());
        let cookie = login_user(&h, "_a1", &["admins", "staff"]).await;

        let session = session_of(&h, &cookie);
        assert_eq!(session.user.as_deref(), Some("jdoe@example.com"));
        assert_eq!(session.groups, vec!["admins", "staff"]);
        assert_eq!(session.auth.as_deref(), Some("saml"));
        assert_eq!(session.role.as_deref(), Some("admin"));
        assert!(session.authn_request_id.is_none());
        assert_eq!(session.name_id(), Some("jdoe@example.com"));
        assert!(h.store.is_assertion_used("_a1").unwrap());

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/session", Some(&cookie)))
            .await
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["authenticated"], true);
        assert_eq!(body["role"], "admin");
    }

    #[tokio::test]
    async fn test_acs_rejects_replayed_assertion() {
        let h = harness(config());
        let cookie = login_user(&h, "_a2", &["staff"]).await;

        let replay = encoded_response(
            None,
            "_a2",
            "jdoe@example.com",
            &[("User.email", &["jdoe@example.com"])],
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                Some(&cookie),
                &[("SAMLResponse", &replay)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_string(response).await;
        assert!(body.contains("replay"));
        assert!(body.contains("Not authenticated"));
    }

    #[tokio::test]
    async fn test_acs_rejects_mismatched_request() {
        let h = harness(config());
        let (cookie, _) = start_sso(&h).await;
        let response = encoded_response(Some("_someone_else"), "_a3", "jdoe@example.com", &[]);

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                Some(&cookie),
                &[("SAMLResponse", &response)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("InResponseTo"));
    }

    #[tokio::test]
    async fn test_acs_without_response() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form("/auth/saml/acs", None, &[("RelayState", "x")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_acs_denies_user_outside_allow_list() {
        let mut config = config();
        config.authz.allowed_groups = Some(StringList::Csv("admins, auditors".to_string()));
        let h = harness(config);

        let (cookie, request_id) = start_sso(&h).await;
        let response = encoded_response(
            Some(&request_id),
            "_a4",
            "jdoe@example.com",
            &[("User.email", &["jdoe@example.com"]), ("memberOf", &["staff"])],
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                Some(&cookie),
                &[("SAMLResponse", &response)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://reports.example.com/auth/unauthorized"
        );
        assert!(session_of_opt(&h, &cookie).is_none());
        assert!(!session_of(&h, &session_cookie(&response)).is_authenticated());
    }

    #[tokio::test]
    async fn test_acs_mapping_error_in_debug() {
        let mut config = config();
        config.debug = true;
        let h = harness(config);

        let (cookie, request_id) = start_sso(&h).await;
        let response = encoded_response(
            Some(&request_id),
            "_a5",
            "jdoe@example.com",
            &[("mail", &["jdoe@example.com"])],
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/acs",
                Some(&cookie),
                &[("SAMLResponse", &response)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_string(response)
            .await
            .contains("SAML Mapping error: user not found in SAML attributes (mail)"));
    }

    #[tokio::test]
    async fn test_sp_initiated_logout() {
        let h = harness(config());
        let cookie = login_user(&h, "_a6", &["staff"]).await;

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/slo?SAMLRequest="));
        assert!(location(&response).contains("RelayState="));

        let request_id = session_of(&h, &cookie).logout_request_id.unwrap();
        let logout_response = encoded_logout_response(Some(&request_id), STATUS_SUCCESS);
        let uri = format!(
            "/auth/saml/sls?SAMLResponse={}",
            urlencoding::encode(&logout_response)
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get(&uri, Some(&cookie)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert!(body_string(response)
            .await
            .contains(r#"href="https://reports.example.com/""#));

        assert!(session_of_opt(&h, &cookie).is_none());
    }

    #[tokio::test]
    async fn test_sls_rejects_wrong_in_response_to() {
        let h = harness(config());
        let cookie = login_user(&h, "_a7", &["staff"]).await;

        h.auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", Some(&cookie)))
            .await
            .unwrap();

        let logout_response = encoded_logout_response(Some("_not_ours"), STATUS_SUCCESS);
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(post_form(
                "/auth/saml/sls",
                Some(&cookie),
                &[("SAMLResponse", &logout_response)],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("InResponseTo"));
        assert!(session_of(&h, &cookie).is_authenticated());
    }

    #[tokio::test]
    async fn test_idp_initiated_logout_ends_all_sessions() {
        let h = harness(config());
        let first = login_user(&h, "_a8", &["staff"]).await;
        let second = login_user(&h, "_a9", &["staff"]).await;

        let uri = format!(
            "/auth/saml/sls?SAMLRequest={}&RelayState=abc",
            urlencoding::encode(&encoded_logout_request("jdoe@example.com"))
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get(&uri, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/slo?SAMLResponse="));
        assert!(location(&response).ends_with("&RelayState=abc"));

        for cookie in [first, second] {
            assert!(session_of_opt(&h, &cookie).is_none());
        }
    }

    #[tokio::test]
    async fn test_sls_malformed_message() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/sls?SAMLRequest=%40%40%40", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response)
            .await
            .contains("An error occurred during logout"));
    }

    #[tokio::test]
    async fn test_slo_with_sso_disabled_is_local() {
        let mut config = config();
        config.disable_sso = true;
        let h = harness(config);
        let cookie = login_user(&h, "_a10", &["staff"]).await;

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", Some(&cookie)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("logged out"));
        assert!(session_of_opt(&h, &cookie).is_none());
    }

    #[tokio::test]
    async fn test_slo_without_idp_endpoint_is_local() {
        let mut config = config();
        config.idp.slo_url = None;
        let h = harness(config);
        let cookie = login_user(&h, "_a11", &["staff"]).await;

        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", Some(&cookie)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(session_of_opt(&h, &cookie).is_none());
    }

    #[tokio::test]
    async fn test_acs_rotates_session_id() {
        let h = harness(config());
        let (pre_login, request_id) = start_sso(&h).await;
        let encoded = encoded_response(
            Some(&request_id),
            "_a12",
            "jdoe@example.com",
            &[("User.email", &["jdoe@example.com"])],
        );

        let response = post_acs(&h, Some(&pre_login), &encoded).await;
        assert_eq!(response.status(), StatusCode::FOUND);

        let post_login = session_cookie(&response);
        assert_ne!(post_login, pre_login);
        assert!(session_of_opt(&h, &pre_login).is_none());
        assert!(session_of(&h, &post_login).is_authenticated());
    }

    #[tokio::test]
    async fn test_acs_accepts_idp_initiated_after_abandoned_sso() {
        let h = harness(config());
        let (cookie, _) = start_sso(&h).await;
        let encoded = encoded_response(
            None,
            "_a13",
            "jdoe@example.com",
            &[("User.email", &["jdoe@example.com"])],
        );

        let response = post_acs(&h, Some(&cookie), &encoded).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            location(&response),
            "https://reports.example.com/show/dashboard"
        );
    }

    #[tokio::test]
    async fn test_acs_failure_clears_pending_request() {
        let h = harness(config());
        let (cookie, _) = start_sso(&h).await;
        let encoded = encoded_response(Some("_someone_else"), "_a14", "jdoe@example.com", &[]);

        let response = post_acs(&h, Some(&cookie), &encoded).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(session_of(&h, &cookie).authn_request_id.is_none());
    }

    #[tokio::test]
    async fn test_acs_rejects_unsigned_and_forged_responses() {
        let h = harness(config());

        for signing in [Signing::Unsigned, Signing::Forged, Signing::Dummy] {
            let encoded = ResponseFixture {
                signing,
                ..Default::default()
            }
            .encode();
            let response = post_acs(&h, None, &encoded).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{:?}", signing);
        }
        assert!(!h.store.is_assertion_used("_assert1").unwrap());
    }

    #[tokio::test]
    async fn test_denied_relogin_drops_previous_identity() {
        let mut config = config();
        config.authz.allowed_groups = Some(StringList::Csv("admins".to_string()));
        let h = harness(config);
        let cookie = login_user(&h, "_a15", &["admins"]).await;
        assert_eq!(session_of(&h, &cookie).role.as_deref(), Some("admin"));

        let encoded = encoded_response(
            None,
            "_a16",
            "mallory@example.com",
            &[("User.email", &["mallory@example.com"]), ("memberOf", &["staff"])],
        );
        let response = post_acs(&h, Some(&cookie), &encoded).await;
        assert_eq!(
            location(&response),
            "https://reports.example.com/auth/unauthorized"
        );

        assert!(session_of_opt(&h, &cookie).is_none());
        let session = session_of(&h, &session_cookie(&response));
        assert!(!session.is_authenticated());
        assert!(session.user.is_none());
        assert!(session.role.is_none());
        assert!(session.groups.is_empty());
    }

    #[tokio::test]
    async fn test_slo_without_session_contacts_idp() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/slo?SAMLRequest="));
    }

    #[tokio::test]
    async fn test_slo_without_session_and_sso_disabled() {
        let mut config = config();
        config.disable_sso = true;
        let h = harness(config);
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/saml/slo", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sls_rejects_unsigned_logout_request() {
        let h = harness(config());
        let cookie = login_user(&h, "_a17", &["staff"]).await;

        let uri = format!(
            "/auth/saml/sls?SAMLRequest={}",
            urlencoding::encode(&encoded_unsigned_logout_request("jdoe@example.com"))
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get(&uri, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(session_of(&h, &cookie).is_authenticated());
    }

    #[tokio::test]
    async fn test_idp_initiated_logout_with_query_signature() {
        let h = harness(config());
        let cookie = login_user(&h, "_a18", &["staff"]).await;

        let uri = format!(
            "/auth/saml/sls?{}",
            query_signed_logout_request("jdoe@example.com", "abc")
        );
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get(&uri, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("https://idp.example.com/slo?SAMLResponse="));
        assert!(session_of_opt(&h, &cookie).is_none());
    }

    #[tokio::test]
    async fn test_session_endpoint_without_cookie() {
        let h = harness(config());
        let response = h
            .auth
            .clone()
            .router()
            .oneshot(get("/auth/session", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["authenticated"], false);
    }
}
