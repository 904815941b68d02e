//! Embeds the bundled helm charts under `charts/` into the binary.
//!
//! Every `*.tgz` becomes an entry of `CHARTS`, keyed by its upper-snake file
//! name: `fluent-bit-2.8.12.tgz` is `FLUENT_BIT_2_8_12_TGZ`.

use std::{fmt::Write, path::Path};

fn chart_key(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn main() {
    let manifest_dir =
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR should be set");
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR should be set");
    let charts_dir = Path::new(&manifest_dir).join("charts");
    println!("cargo:rerun-if-changed={}", charts_dir.display());

    let mut charts: Vec<(String, String)> = match std::fs::read_dir(&charts_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "tgz"))
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                Some((chart_key(&name), p.display().to_string()))
            })
            .collect(),
        Err(_) => vec![],
    };
    charts.sort();

    let mut table = String::from("pub static CHARTS: &[(&str, &[u8])] = &[\n");
    for (key, path) in &charts {
        println!("cargo:rerun-if-changed={}", path);
        writeln!(table, "    ({:?}, include_bytes!({:?})),", key, path)
            .expect("writing to a String cannot fail");
    }
    table.push_str("];\n");

    let dest = Path::new(&out_dir).join("charts.rs");
    std::fs::write(&dest, table)
        .unwrap_or_else(|e| panic!("failed to write {}: {}", dest.display(), e));
}
