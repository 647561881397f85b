//! Fuzz target: API dispatcher wire path
//!
//! Feeds arbitrary bytes to `Registry::handle_request` over a registry
//! whose endpoints declare every parameter kind, and checks:
//! - No panics under arbitrary input
//! - Every reply is a JSON envelope with a numeric `code`
//! - Anonymous callers never reach the authenticated endpoint
//!
//! cargo fuzz run fuzz_api_request

#![no_main]

use libfuzzer_sys::fuzz_target;
use rackctl::api::{Category, Endpoint, ParamSpec, Registry};
use serde_json::{Value, json};

static PARAMS: &[ParamSpec] = &[
    ParamSpec::int("id", 0, 3).required(),
    ParamSpec::float("level", -10.0, 10.0),
    ParamSpec::bool("enable"),
    ParamSpec::one_of("mode", &["off", "manual", "auto", "curve"]),
    ParamSpec::array("points", 8),
];

fn registry() -> Registry {
    let mut r = Registry::new();
    let open = Endpoint::new("fuzz.open", "schema sink", Category::System, |p, res| {
        res.ok(json!({
            "id": p.req_i64("id")?,
            "level": p.f64("level"),
            "enable": p.bool("enable"),
            "mode": p.str("mode"),
            "points": p.array("points").map(Vec::len),
        }));
        Ok(())
    })
    .params(PARAMS);
    let locked = Endpoint::new("fuzz.locked", "must stay closed", Category::Device, |_, _| {
        panic!("reached an authenticated handler anonymously")
    })
    .permission("device.control");
    if r.register_multiple([open, locked]).is_err() {
        unreachable!("static endpoint names are distinct");
    }
    r
}

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };
    let reply = registry().handle_request(text, None);
    let envelope: Value = serde_json::from_str(&reply).expect("reply is JSON");
    assert!(envelope["code"].is_u64(), "no code in {reply}");
});
