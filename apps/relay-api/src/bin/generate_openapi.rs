//! Write the relay's OpenAPI document. Usage: `generate-openapi [OUT_PATH]`
//! (defaults to `specs/relay-api.json` at the workspace root).

use std::path::PathBuf;

use utoipa::OpenApi;

fn main() {
    let spec = relay_api::routes::ApiDoc::openapi().to_pretty_json().unwrap();
    let out = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../specs/relay-api.json")
    });
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&out, spec).unwrap();
    println!("Wrote {}", out.display());
}
