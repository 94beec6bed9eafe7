/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::path::Path::new("src/generated");
    if !out_dir.exists() {
        std::fs::create_dir_all(out_dir)?;
    }

    println!("cargo:rerun-if-changed=proto/provider.proto");

    tonic_build::configure()
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .out_dir(out_dir)
        .compile_protos(&["proto/provider.proto"], &["proto"])?;
    Ok(())
}
