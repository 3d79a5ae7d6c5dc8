//! Per-request orchestration context.
//!
//! A [`RequestContext`] is built once at the edge (from transport headers
//! or a serialized map) and threaded by reference through every lifecycle
//! call. It is immutable by convention: nothing in this crate mutates a
//! context after construction, and hosts that need to override fields do
//! so before handing it in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LifecycleError;

/// Transport headers as delivered by the host, keyed by header name.
///
/// Values are JSON so hosts can hand through whatever their transport
/// parsed; anything other than a JSON string for a present header is
/// rejected at construction.
pub type HeaderMap = BTreeMap<String, Value>;

/// Generate a fresh request id in the `req-<uuid>` form the rest of the
/// system expects.
pub fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Request and credential metadata for one orchestration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub auth_token: Option<String>,
    pub auth_token_info: Option<Value>,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub password: Option<String>,
    /// Legacy credential blob, stored verbatim and parsed at point of use.
    pub legacy_creds: Option<String>,
    pub tenant: Option<String>,
    pub tenant_id: Option<String>,
    pub auth_url: Option<String>,
    pub region_name: Option<String>,
    pub trust_id: Option<String>,
    pub trustor_user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub show_deleted: bool,
    #[serde(default = "new_request_id")]
    pub request_id: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            auth_token: None,
            auth_token_info: None,
            username: None,
            user_id: None,
            password: None,
            legacy_creds: None,
            tenant: None,
            tenant_id: None,
            auth_url: None,
            region_name: None,
            trust_id: None,
            trustor_user_id: None,
            roles: Vec::new(),
            is_admin: false,
            show_deleted: false,
            request_id: new_request_id(),
        }
    }
}

impl RequestContext {
    /// Context with administrative rights and no user credentials.
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::default()
        }
    }

    /// Build a context from transport headers.
    ///
    /// Absent headers leave their field unset. A present header whose
    /// value is not a JSON string fails with
    /// [`LifecycleError::NotAuthenticated`].
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, LifecycleError> {
        let roles = match header_string(headers, "X-Roles")? {
            Some(raw) if !raw.is_empty() => {
                raw.split(',').map(|r| r.trim().to_string()).collect()
            }
            _ => Vec::new(),
        };
        let request_id =
            header_string(headers, "X-Request-Id")?.unwrap_or_else(new_request_id);

        Ok(Self {
            auth_token: header_string(headers, "X-Auth-Token")?,
            auth_token_info: None,
            username: header_string(headers, "X-Auth-User")?,
            user_id: header_string(headers, "X-User-Id")?,
            password: header_string(headers, "X-Auth-Key")?,
            legacy_creds: header_string(headers, "X-Auth-EC2-Creds")?,
            tenant: header_string(headers, "X-Tenant-Name")?,
            tenant_id: header_string(headers, "X-Tenant-Id")?,
            auth_url: header_string(headers, "X-Auth-Url")?,
            region_name: header_string(headers, "X-Region-Name")?,
            trust_id: None,
            trustor_user_id: None,
            roles,
            is_admin: false,
            show_deleted: false,
            request_id,
        })
    }

    /// Rebuild a context from a map produced by [`RequestContext::to_map`].
    ///
    /// A map without a `request_id` gets a fresh one.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, LifecycleError> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| LifecycleError::NotAuthenticated(format!("invalid context map: {}", e)))
    }

    /// Serialize to a flat map, the inverse of
    /// [`RequestContext::from_map`]. Unset fields serialize as `null`; an
    /// `auth_token_info` of `Some(Value::Null)` shares that encoding and
    /// reads back as `None`.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("auth_token".to_string(), opt_string(&self.auth_token));
        map.insert(
            "auth_token_info".to_string(),
            self.auth_token_info.clone().unwrap_or(Value::Null),
        );
        map.insert("username".to_string(), opt_string(&self.username));
        map.insert("user_id".to_string(), opt_string(&self.user_id));
        map.insert("password".to_string(), opt_string(&self.password));
        map.insert("legacy_creds".to_string(), opt_string(&self.legacy_creds));
        map.insert("tenant".to_string(), opt_string(&self.tenant));
        map.insert("tenant_id".to_string(), opt_string(&self.tenant_id));
        map.insert("auth_url".to_string(), opt_string(&self.auth_url));
        map.insert("region_name".to_string(), opt_string(&self.region_name));
        map.insert("trust_id".to_string(), opt_string(&self.trust_id));
        map.insert(
            "trustor_user_id".to_string(),
            opt_string(&self.trustor_user_id),
        );
        map.insert(
            "roles".to_string(),
            Value::Array(self.roles.iter().cloned().map(Value::String).collect()),
        );
        map.insert("is_admin".to_string(), Value::Bool(self.is_admin));
        map.insert("show_deleted".to_string(), Value::Bool(self.show_deleted));
        map.insert(
            "request_id".to_string(),
            Value::String(self.request_id.clone()),
        );
        map
    }

    /// Parse the stored legacy credential blob.
    ///
    /// The blob is kept verbatim at construction so a malformed one only
    /// fails the caller that actually needs it.
    pub fn legacy_credentials(&self) -> Result<Option<Value>, LifecycleError> {
        match &self.legacy_creds {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                LifecycleError::NotAuthenticated(format!("invalid legacy credentials: {}", e))
            }),
        }
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|s| Value::String(s.clone()))
        .unwrap_or(Value::Null)
}

fn header_string(headers: &HeaderMap, name: &str) -> Result<Option<String>, LifecycleError> {
    match headers.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(LifecycleError::NotAuthenticated(format!(
            "header {} must be a string, got {}",
            name, other
        ))),
    }
}
