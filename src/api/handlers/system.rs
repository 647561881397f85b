//! `api.*` introspection endpoints.

use std::sync::Arc;

use serde_json::json;

use crate::api::{Catalog, Category, Endpoint, ParamSpec, schema_json};
use crate::error::Error;

const CATEGORY_NAMES: &[&str] = &[
    "system", "config", "hal", "led", "fan", "power", "network", "device", "storage",
];

const LIST_PARAMS: &[ParamSpec] = &[ParamSpec::one_of("category", CATEGORY_NAMES)];

const INFO_PARAMS: &[ParamSpec] = &[ParamSpec::str("name").required()];

pub fn endpoints(catalog: Arc<Catalog>) -> Vec<Endpoint> {
    let c_list = Arc::clone(&catalog);
    vec![
        Endpoint::new("api.list", "List registered endpoints", Category::System, move |p, res| {
            let category = p.str("category").and_then(Category::parse);
            let list = c_list.list(category);
            res.ok(json!({"count": list.len(), "endpoints": list}));
            Ok(())
        })
        .params(LIST_PARAMS),
        Endpoint::new("api.info", "Describe one endpoint", Category::System, move |p, res| {
            let (info, params) = catalog.get_info(p.req_str("name")?).ok_or(Error::NotFound)?;
            let mut v = json!(info);
            v["params"] = schema_json(params);
            res.ok(v);
            Ok(())
        })
        .params(INFO_PARAMS),
    ]
}
