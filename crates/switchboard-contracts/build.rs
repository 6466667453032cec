use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

struct SchemaFile {
    canonical_path: String,
    sha256: String,
    body: String,
}

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let repo_root = manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("repo root")
        .to_path_buf();
    let contracts_dir = repo_root.join("contracts/v1");
    let openapi_path = repo_root.join("openapi/v1.yaml");

    println!("cargo:rerun-if-changed={}", contracts_dir.display());
    println!("cargo:rerun-if-changed={}", openapi_path.display());

    let schemas = load_schema_files(&contracts_dir);
    for schema in &schemas {
        println!(
            "cargo:rerun-if-changed={}",
            contracts_dir.join(file_name(&schema.canonical_path)).display()
        );
    }

    let mut set_hasher = Sha256::new();
    for schema in &schemas {
        set_hasher.update(schema.canonical_path.as_bytes());
        set_hasher.update(b"\n");
        set_hasher.update(schema.body.as_bytes());
        set_hasher.update(b"\n");
    }
    let contracts_set_sha = hex_digest(set_hasher);

    let openapi_bytes = fs::read(&openapi_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", openapi_path.display()));
    let openapi_sha = sha256_hex(&openapi_bytes);
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut out = String::new();
    let _ = writeln!(out, "pub const GENERATED_OPENAPI_SHA256: &str = {openapi_sha:?};");
    let _ = writeln!(
        out,
        "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {contracts_set_sha:?};"
    );
    let _ = writeln!(out, "pub const GENERATED_AT_RFC3339: &str = {generated_at:?};");
    let _ = writeln!(out, "pub static GENERATED_SCHEMAS: &[ContractSchema] = &[");
    for schema in &schemas {
        let _ = writeln!(
            out,
            "    ContractSchema {{ path: {:?}, sha256: {:?}, body: {:?} }},",
            schema.canonical_path, schema.sha256, schema.body
        );
    }
    let _ = writeln!(out, "];");

    let out_path = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_path.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

fn load_schema_files(contracts_dir: &PathBuf) -> Vec<SchemaFile> {
    let mut paths: Vec<PathBuf> = fs::read_dir(contracts_dir)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", contracts_dir.display()))
        .filter_map(|entry| entry.ok().map(|v| v.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let body = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
            let name = path
                .file_name()
                .and_then(|v| v.to_str())
                .expect("schema file name")
                .to_string();
            SchemaFile {
                canonical_path: format!("contracts/v1/{name}"),
                sha256: sha256_hex(body.as_bytes()),
                body,
            }
        })
        .collect()
}

fn file_name(canonical_path: &str) -> &str {
    canonical_path.rsplit('/').next().unwrap_or(canonical_path)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
