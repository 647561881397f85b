//! API registry and dispatcher.
//!
//! Every externally reachable operation is an [`Endpoint`] with a dotted
//! name. The registry is filled once at startup and is read-only
//! afterwards, so [`Registry::call`] takes `&self` and needs no lock.
//!
//! Dispatch pipeline:
//!
//! 1. **Lookup** by exact name → `NOT_FOUND`.
//! 2. **Authentication** when the endpoint requires it → `UNAUTHORIZED`.
//! 3. **Permission** check against the principal → `FORBIDDEN`.
//! 4. **Parameter schema** validation → `INVALID_ARG` naming the field.
//! 5. **Handler** completes the [`ApiResult`]; an error return or an
//!    uncompleted result become error envelopes.

pub mod auth;
pub mod handlers;
pub mod params;
pub mod result;

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};

pub use auth::{Level, Principal, SessionTable};
pub use params::{Kind, ParamSpec, Params};
pub use result::{ApiCode, ApiResult};

pub const MAX_ENDPOINTS: usize = 128;
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    System,
    Config,
    Hal,
    Led,
    Fan,
    Power,
    Network,
    Device,
    Storage,
}

impl Category {
    pub const ALL: [Self; 9] = [
        Self::System,
        Self::Config,
        Self::Hal,
        Self::Led,
        Self::Fan,
        Self::Power,
        Self::Network,
        Self::Device,
        Self::Storage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Config => "config",
            Self::Hal => "hal",
            Self::Led => "led",
            Self::Fan => "fan",
            Self::Power => "power",
            Self::Network => "network",
            Self::Device => "device",
            Self::Storage => "storage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == s)
    }
}

pub type Handler = Box<dyn Fn(&Params<'_>, &mut ApiResult) -> Result<()> + Send + Sync>;

pub struct Endpoint {
    pub name: &'static str,
    pub description: &'static str,
    pub category: Category,
    pub params: &'static [ParamSpec],
    pub requires_auth: bool,
    pub permission: Option<&'static str>,
    pub handler: Handler,
}

impl Endpoint {
    /// Unauthenticated endpoint with no parameters.
    pub fn new(
        name: &'static str,
        description: &'static str,
        category: Category,
        handler: impl Fn(&Params<'_>, &mut ApiResult) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            description,
            category,
            params: &[],
            requires_auth: false,
            permission: None,
            handler: Box::new(handler),
        }
    }

    pub fn params(mut self, params: &'static [ParamSpec]) -> Self {
        self.params = params;
        self
    }

    pub fn auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    /// Requires authentication and `permission`.
    pub fn permission(mut self, permission: &'static str) -> Self {
        self.requires_auth = true;
        self.permission = Some(permission);
        self
    }
}

/// Discovery record returned by [`Registry::list`] and [`Registry::get_info`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EndpointInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub requires_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<&'static str>,
}

/// Wire request `{method, params}`.
#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Read-only view of the registered endpoints, shared with the
/// introspection handlers (`api.list`, `api.info`).
#[derive(Default)]
pub struct Catalog {
    entries: RwLock<Vec<(EndpointInfo, &'static [ParamSpec])>>,
}

impl Catalog {
    pub fn list(&self, category: Option<Category>) -> Vec<EndpointInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(i, _)| category.is_none_or(|c| i.category == c.name()))
            .map(|(i, _)| i.clone())
            .collect()
    }

    pub fn get_info(&self, name: &str) -> Option<(EndpointInfo, &'static [ParamSpec])> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(i, _)| i.name == name)
            .cloned()
    }
}

pub struct Registry {
    endpoints: Vec<Endpoint>,
    catalog: Arc<Catalog>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            catalog: Arc::new(Catalog::default()),
        }
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog)
    }

    fn find(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    // ── Registration ──────────────────────────────────────────

    pub fn register(&mut self, endpoint: Endpoint) -> Result<()> {
        if endpoint.name.is_empty() || endpoint.name.len() > MAX_NAME_LEN {
            warn!("api: invalid endpoint name {:?}", endpoint.name);
            return Err(Error::InvalidArg("endpoint name must be 1-64 characters"));
        }
        if self.find(endpoint.name).is_some() {
            warn!("api: already registered: {}", endpoint.name);
            return Err(Error::InvalidState);
        }
        if self.endpoints.len() >= MAX_ENDPOINTS {
            warn!("api: no free endpoint slots");
            return Err(Error::Internal("endpoint table full"));
        }
        debug!("api: registered {}", endpoint.name);
        self.catalog
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((info_of(&endpoint), endpoint.params));
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Register in order, stopping at the first failure.
    pub fn register_multiple(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Result<()> {
        endpoints.into_iter().try_for_each(|e| self.register(e))
    }

    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let idx = self
            .endpoints
            .iter()
            .position(|e| e.name == name)
            .ok_or(Error::NotFound)?;
        self.endpoints.remove(idx);
        self.catalog
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(i, _)| i.name != name);
        debug!("api: unregistered {}", name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    // ── Dispatch ──────────────────────────────────────────────

    pub fn call(&self, name: &str, params: &Value, principal: Option<&Principal>) -> ApiResult {
        let mut result = ApiResult::new();

        let Some(ep) = self.find(name) else {
            warn!("api: not found: {} ({} registered)", name, self.endpoints.len());
            result.error(ApiCode::NotFound, "API not found");
            return result;
        };

        if ep.requires_auth {
            let Some(p) = principal else {
                result.error(ApiCode::Unauthorized, "Authentication required");
                return result;
            };
            if let Some(perm) = ep.permission {
                if !p.has(perm) {
                    warn!("api: {} denied {} (needs {})", p.name, name, perm);
                    result.error(ApiCode::Forbidden, format!("Permission required: {perm}"));
                    return result;
                }
            }
        }

        let params = match params::validate(ep.params, params) {
            Ok(p) => p,
            Err(msg) => {
                result.error(ApiCode::InvalidArg, msg);
                return result;
            }
        };

        debug!("api: calling {}", name);
        match (ep.handler)(&params, &mut result) {
            Err(e) => {
                debug!("api: {} failed: {}", name, e);
                result.fail(e);
            }
            Ok(()) if !result.is_completed() => {
                result.error(ApiCode::Internal, "Handler error");
            }
            Ok(()) => {}
        }
        result
    }

    /// `params_json` may be empty (no parameters).
    pub fn call_str(&self, name: &str, params_json: &str, principal: Option<&Principal>) -> ApiResult {
        let params = if params_json.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(params_json) {
                Ok(v) => v,
                Err(_) => {
                    let mut r = ApiResult::new();
                    r.error(ApiCode::InvalidArg, "Invalid JSON");
                    return r;
                }
            }
        };
        self.call(name, &params, principal)
    }

    /// Handle a wire request `{"method": ..., "params": ...}` and return the
    /// serialized envelope.
    pub fn handle_request(&self, request: &str, principal: Option<&Principal>) -> String {
        match serde_json::from_str::<Request>(request) {
            Ok(req) => self.call(&req.method, &req.params, principal).to_json(),
            Err(_) => {
                let mut r = ApiResult::new();
                r.error(ApiCode::InvalidArg, "Invalid JSON");
                r.to_json()
            }
        }
    }

    // ── Introspection ─────────────────────────────────────────

    pub fn list(&self, category: Option<Category>) -> Vec<EndpointInfo> {
        self.catalog.list(category)
    }

    pub fn get_info(&self, name: &str) -> Option<EndpointInfo> {
        self.find(name).map(info_of)
    }

    pub fn log_summary(&self) {
        for c in Category::ALL {
            let n = self.endpoints.iter().filter(|e| e.category == c).count();
            if n > 0 {
                info!("api: {} {} endpoints", n, c.name());
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn info_of(e: &Endpoint) -> EndpointInfo {
    EndpointInfo {
        name: e.name,
        description: e.description,
        category: e.category.name(),
        requires_auth: e.requires_auth,
        permission: e.permission,
    }
}

/// JSON description of a parameter schema.
pub fn schema_json(specs: &[ParamSpec]) -> Value {
    Value::Array(
        specs
            .iter()
            .map(|s| {
                let (kind, extra) = match s.kind {
                    Kind::Int { min, max } => ("int", json!({"min": min, "max": max})),
                    Kind::Float { min, max } => ("float", json!({"min": min, "max": max})),
                    Kind::Bool => ("bool", Value::Null),
                    Kind::Str { one_of } if one_of.is_empty() => ("string", Value::Null),
                    Kind::Str { one_of } => ("string", json!({"one_of": one_of})),
                    Kind::Array { max_len } => ("array", json!({"max_len": max_len})),
                };
                let mut v = json!({"name": s.name, "type": kind, "required": s.required});
                if let (Value::Object(m), Value::Object(x)) = (&mut v, extra) {
                    m.extend(x);
                }
                v
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO_PARAMS: &[ParamSpec] = &[ParamSpec::int("n", 0, 10).required()];

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register_multiple([
            Endpoint::new("sys.echo", "Echo n", Category::System, |p, res| {
                res.ok(json!({"n": p.req_i64("n")?}));
                Ok(())
            })
            .params(ECHO_PARAMS),
            Endpoint::new("sys.silent", "Forgets to complete", Category::System, |_, _| Ok(())),
            Endpoint::new("sys.fail", "Fails", Category::System, |_, _| {
                Err(Error::Hardware(crate::app::ports::HwError::GpioWriteFailed))
            }),
            Endpoint::new("dev.poke", "Needs auth", Category::Device, |_, res| {
                res.ok(Value::Null);
                Ok(())
            })
            .permission("device.control"),
        ])
        .unwrap();
        r
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut r = registry();
        let dup = Endpoint::new("sys.echo", "again", Category::System, |_, _| Ok(()));
        assert_eq!(r.register(dup), Err(Error::InvalidState));
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn long_names_are_rejected() {
        let mut r = Registry::new();
        let name: &'static str = Box::leak("x".repeat(MAX_NAME_LEN + 1).into_boxed_str());
        let ep = Endpoint::new(name, "", Category::System, |_, _| Ok(()));
        assert!(matches!(r.register(ep), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn table_is_bounded() {
        let mut r = Registry::new();
        for i in 0..MAX_ENDPOINTS {
            let name: &'static str = Box::leak(format!("e.{i}").into_boxed_str());
            r.register(Endpoint::new(name, "", Category::System, |_, _| Ok(()))).unwrap();
        }
        let extra = Endpoint::new("e.extra", "", Category::System, |_, _| Ok(()));
        assert!(matches!(r.register(extra), Err(Error::Internal(_))));
    }

    #[test]
    fn unknown_endpoint() {
        let r = registry();
        assert_eq!(r.call("nope", &Value::Null, None).code(), ApiCode::NotFound);
    }

    #[test]
    fn handler_errors_become_envelopes() {
        let r = registry();
        let res = r.call("sys.silent", &Value::Null, None);
        assert_eq!(res.code(), ApiCode::Internal);
        assert_eq!(res.message(), Some("Handler error"));
        assert_eq!(r.call("sys.fail", &Value::Null, None).code(), ApiCode::Hardware);
    }

    #[test]
    fn auth_then_permission() {
        let r = registry();
        assert_eq!(r.call("dev.poke", &Value::Null, None).code(), ApiCode::Unauthorized);
        let viewer = Principal::new("viewer", Level::User);
        assert_eq!(r.call("dev.poke", &Value::Null, Some(&viewer)).code(), ApiCode::Forbidden);
        let admin = Principal::new("ops", Level::Admin);
        assert!(r.call("dev.poke", &Value::Null, Some(&admin)).is_ok());
    }

    #[test]
    fn call_str_rejects_bad_json() {
        let r = registry();
        let res = r.call_str("sys.echo", "{n:", None);
        assert_eq!(res.code(), ApiCode::InvalidArg);
        assert_eq!(res.message(), Some("Invalid JSON"));
        assert_eq!(r.call_str("sys.echo", r#"{"n": 4}"#, None).data(), Some(&json!({"n": 4})));
    }

    #[test]
    fn wire_request_round_trip() {
        let r = registry();
        let out: Value =
            serde_json::from_str(&r.handle_request(r#"{"method":"sys.echo","params":{"n":11}}"#, None))
                .unwrap();
        assert_eq!(out["code"], 1);
        assert_eq!(out["message"], "Parameter n must be 0-10");
        let out: Value = serde_json::from_str(&r.handle_request("[]", None)).unwrap();
        assert_eq!(out["code"], 1);
    }

    #[test]
    fn listing_filters_by_category() {
        let r = registry();
        assert_eq!(r.list(None).len(), 4);
        let dev = r.list(Some(Category::Device));
        assert_eq!(dev.len(), 1);
        assert!(dev[0].requires_auth);
        assert_eq!(r.get_info("sys.echo").map(|i| i.category), Some("system"));
        assert!(r.get_info("nope").is_none());
    }

    #[test]
    fn unregister_removes() {
        let mut r = registry();
        let catalog = r.catalog();
        r.unregister("sys.fail").unwrap();
        assert!(catalog.get_info("sys.fail").is_none());
        assert_eq!(r.unregister("sys.fail"), Err(Error::NotFound));
        assert_eq!(r.call("sys.fail", &Value::Null, None).code(), ApiCode::NotFound);
    }
}
