//! Compiles the vendored CSI v1 protobuf definitions.
//!
//! The generated module lands in `OUT_DIR` as `csi.v1.rs` and is pulled in by
//! `src/csi/mod.rs` via `include!`. The proto file is trimmed to the messages
//! and services this plugin serves; field tags match the upstream
//! container-storage-interface spec, so the wire format is unchanged.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/csi.proto");
    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/csi.proto"], &["proto"])?;
    Ok(())
}
