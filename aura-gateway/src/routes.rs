//! Route table: `(method, path pattern)` mapped to a bus subject
//!
//! Routes are classified at registration and never change afterwards, so a
//! protected route cannot silently downgrade to public. Patterns use
//! `{name}` segments for path parameters.

use http::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Reply shape the routing plugin expects from the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Single reply
    Unary,
    /// Chunked or binary stream of frames
    Stream,
}

/// Expected JSON type for a contract field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// One field rule within a payload contract
#[derive(Debug, Clone, Serialize)]
pub struct FieldRule {
    /// JSON pointer, e.g. `/message`
    pub pointer: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Per-route payload contract checked by the validation plugin
#[derive(Debug, Clone, Default, Serialize)]
pub struct PayloadContract {
    pub fields: Vec<FieldRule>,
}

impl PayloadContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, pointer: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            pointer: pointer.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, pointer: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            pointer: pointer.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check a decoded payload, pointing at the first failing field
    pub fn validate(&self, payload: &serde_json::Value) -> Result<()> {
        for rule in &self.fields {
            match payload.pointer(&rule.pointer) {
                None => {
                    if rule.required {
                        return Err(Error::BadPayload {
                            pointer: rule.pointer.clone(),
                            message: "required field is missing".into(),
                        });
                    }
                }
                Some(value) => {
                    if !rule.kind.matches(value) {
                        return Err(Error::BadPayload {
                            pointer: rule.pointer.clone(),
                            message: format!("expected {:?}", rule.kind).to_lowercase(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A registered route
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: String,
    pub subject: String,
    pub kind: RouteKind,
    /// Payload must arrive inside an encryption envelope
    pub encrypted: bool,
    /// Request must carry a valid bearer token
    pub authenticated: bool,
    /// Eligible for a single retry on upstream timeout
    pub idempotent: bool,
    pub contract: Option<PayloadContract>,
}

impl Route {
    /// Protected route: encryption and bearer auth both mandatory
    pub fn protected(method: Method, pattern: &str, subject: &str, kind: RouteKind) -> Self {
        Self {
            idempotent: method == Method::GET,
            method,
            pattern: pattern.to_string(),
            subject: subject.to_string(),
            kind,
            encrypted: true,
            authenticated: true,
            contract: None,
        }
    }

    /// Public route: neither encryption nor auth required
    pub fn public(method: Method, pattern: &str, subject: &str) -> Self {
        Self {
            idempotent: method == Method::GET,
            method,
            pattern: pattern.to_string(),
            subject: subject.to_string(),
            kind: RouteKind::Unary,
            encrypted: false,
            authenticated: false,
            contract: None,
        }
    }

    /// Encrypted but auth-exempt: the credential endpoints, which cannot
    /// require the token they exist to produce
    pub fn encrypted_only(method: Method, pattern: &str, subject: &str) -> Self {
        Self {
            idempotent: false,
            method,
            pattern: pattern.to_string(),
            subject: subject.to_string(),
            kind: RouteKind::Unary,
            encrypted: true,
            authenticated: false,
            contract: None,
        }
    }

    pub fn with_contract(mut self, contract: PayloadContract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    fn matches(&self, method: &Method, path: &str) -> Option<HashMap<String, String>> {
        if &self.method != method {
            return None;
        }
        let pattern_segments: Vec<&str> = self.pattern.trim_matches('/').split('/').collect();
        let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if pattern_segments.len() != path_segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (pat, seg) in pattern_segments.iter().zip(&path_segments) {
            if let Some(name) = pat.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                params.insert(name.to_string(), (*seg).to_string());
            } else if pat != seg {
                return None;
            }
        }
        Some(params)
    }
}

/// Immutable route table, built once at startup
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

/// Builder collecting routes before the table freezes
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<Arc<Route>>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: Route) -> Result<Self> {
        if self
            .routes
            .iter()
            .any(|r| r.method == route.method && r.pattern == route.pattern)
        {
            return Err(Error::Conflict(format!(
                "duplicate route {} {}",
                route.method, route.pattern
            )));
        }
        self.routes.push(Arc::new(route));
        Ok(self)
    }

    pub fn build(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
        }
    }
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::new()
    }

    /// Resolve a method and path to a route plus extracted path parameters
    pub fn resolve(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        self.routes
            .iter()
            .find_map(|route| route.matches(method, path).map(|p| (route.clone(), p)))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// OpenAPI-shaped description of the table for `/openapi.json`
    pub fn openapi(&self) -> serde_json::Value {
        let mut paths = serde_json::Map::new();
        for route in &self.routes {
            let entry = paths
                .entry(route.pattern.clone())
                .or_insert_with(|| serde_json::json!({}));
            entry[route.method.as_str().to_lowercase()] = serde_json::json!({
                "x-subject": route.subject,
                "x-protected": route.encrypted,
                "responses": { "200": { "description": "OK" } },
            });
        }
        serde_json::json!({
            "openapi": "3.0.3",
            "info": {
                "title": "Aura Gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "paths": paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::builder()
            .route(Route::public(Method::GET, "/health", "gateway.health"))
            .unwrap()
            .route(Route::protected(
                Method::POST,
                "/echo",
                "gateway.echo",
                RouteKind::Unary,
            ))
            .unwrap()
            .route(Route::protected(
                Method::GET,
                "/users/{id}",
                "users.get",
                RouteKind::Unary,
            ))
            .unwrap()
            .build()
    }

    #[test]
    fn test_exact_match() {
        let t = table();
        let (route, params) = t.resolve(&Method::POST, "/echo").unwrap();
        assert_eq!(route.subject, "gateway.echo");
        assert!(params.is_empty());
        assert!(t.resolve(&Method::GET, "/echo").is_none());
        assert!(t.resolve(&Method::POST, "/echoes").is_none());
    }

    #[test]
    fn test_path_params() {
        let t = table();
        let (route, params) = t.resolve(&Method::GET, "/users/u42").unwrap();
        assert_eq!(route.subject, "users.get");
        assert_eq!(params["id"], "u42");
        assert!(t.resolve(&Method::GET, "/users/u42/extra").is_none());
    }

    #[test]
    fn test_classification_is_fixed() {
        let t = table();
        let (health, _) = t.resolve(&Method::GET, "/health").unwrap();
        assert!(!health.encrypted && !health.authenticated);
        let (echo, _) = t.resolve(&Method::POST, "/echo").unwrap();
        assert!(echo.encrypted && echo.authenticated);
        let refresh = Route::encrypted_only(Method::POST, "/users/refresh", "users.refresh");
        assert!(refresh.encrypted && !refresh.authenticated);
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let err = RouteTable::builder()
            .route(Route::public(Method::GET, "/health", "a"))
            .unwrap()
            .route(Route::public(Method::GET, "/health", "b"))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_get_routes_default_idempotent() {
        let get = Route::protected(Method::GET, "/x", "x", RouteKind::Unary);
        assert!(get.idempotent);
        let post = Route::protected(Method::POST, "/x", "x", RouteKind::Unary);
        assert!(!post.idempotent);
    }

    #[test]
    fn test_contract_validation() {
        let contract = PayloadContract::new()
            .require("/message", FieldKind::String)
            .optional("/count", FieldKind::Number);

        assert!(contract
            .validate(&serde_json::json!({"message": "hi"}))
            .is_ok());
        assert!(contract
            .validate(&serde_json::json!({"message": "hi", "count": 3}))
            .is_ok());

        let err = contract
            .validate(&serde_json::json!({"count": 3}))
            .unwrap_err();
        assert_eq!(err.pointer(), Some("/message"));

        let err = contract
            .validate(&serde_json::json!({"message": 7}))
            .unwrap_err();
        assert_eq!(err.pointer(), Some("/message"));

        let err = contract
            .validate(&serde_json::json!({"message": "hi", "count": "three"}))
            .unwrap_err();
        assert_eq!(err.pointer(), Some("/count"));
    }

    #[test]
    fn test_openapi_shape() {
        let t = table();
        let api = t.openapi();
        assert_eq!(api["openapi"], "3.0.3");
        assert!(api["paths"]["/echo"]["post"]["x-protected"].as_bool().unwrap());
        assert!(!api["paths"]["/health"]["get"]["x-protected"].as_bool().unwrap());
    }
}
