//! Build script for meshwire-proto
//!
//! Compiles protobuf definitions using tonic-build and emits the file
//! descriptor set used for gRPC server reflection.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = "proto";
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    let protos = ["meshwire/v1/task.proto", "meshwire/v1/status.proto"];

    let proto_paths: Vec<_> = protos
        .iter()
        .map(|p| format!("{}/{}", proto_root, p))
        .collect();

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("meshwire_descriptor.bin"))
        .compile_protos(&proto_paths, &[proto_root])?;

    Ok(())
}
