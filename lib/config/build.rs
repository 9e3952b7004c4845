use serde::Deserialize;
use std::{collections::BTreeMap, env, fs, path::PathBuf};

/// One value of a profile. Booleans and numbers are accepted as JSON values or as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Number(u64),
    Text(String),
}

type Profiles = BTreeMap<String, BTreeMap<String, FlagValue>>;

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let config_path = PathBuf::from(manifest_dir).join("../../dm_config.json");
    let profile = env::var("DM_CONFIG_PROFILE").unwrap_or_else(|_| String::from("default"));
    let flags_str = fs::read_to_string(&config_path).unwrap();
    let profiles: Profiles = serde_json::from_str(&flags_str).unwrap();
    let flags = match profiles.get(profile.as_str()) {
        Some(value) => value,
        None => panic!("Unknown configuration profile `{}`.", profile),
    };
    make_flags(flags);
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", config_path.display());
    println!("cargo:rerun-if-env-changed=DM_CONFIG_PROFILE");
}

fn make_flags(flagmap: &BTreeMap<String, FlagValue>) {
    let mut s = String::from("");
    for (key, value) in flagmap {
        let line = match value {
            FlagValue::Bool(b) => format!("pub const {}: bool = {};\n", key, b),
            FlagValue::Number(n) => format!("pub const {}: usize = {};\n", key, n),
            FlagValue::Text(t) if t == "true" || t == "false" => {
                format!("pub const {}: bool = {};\n", key, t)
            }
            FlagValue::Text(t) => match t.parse::<u64>() {
                Ok(n) => format!("pub const {}: usize = {};\n", key, n),
                Err(_) => panic!("Flag `{}` has unsupported value `{}`.", key, t),
            },
        };
        s += line.as_str();
    }
    let out_dir = env::var("OUT_DIR").unwrap();
    fs::write(PathBuf::from(out_dir).join("build_flags.rs"), s).unwrap();
}
