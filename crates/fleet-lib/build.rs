//! Build script for generating protobuf code
//!
//! Only runs tonic-build when the `proto-gen` feature is enabled; otherwise
//! the checked-in bindings in `src/proto` are used.

use std::path::PathBuf;
use std::process::Command;

const PROTO: &str = "../../proto/simulator/v1/control_plane.proto";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed={}", PROTO);

    if std::env::var_os("CARGO_FEATURE_PROTO_GEN").is_none() {
        return Ok(());
    }

    let protoc_available =
        std::env::var("PROTOC").is_ok() || Command::new("protoc").arg("--version").output().is_ok();

    if !protoc_available {
        return Err("the proto-gen feature requires protoc (install it or set PROTOC)".into());
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(false) // Agents only need the client
        .build_client(true)
        .out_dir(&out_dir)
        .compile(&[PROTO], &["../../proto"])?;

    Ok(())
}
