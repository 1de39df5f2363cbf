//! Build script for compiling the protobuf definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = [
        "proto/edgeorchestra/v1/common.proto",
        "proto/edgeorchestra/v1/device.proto",
        "proto/edgeorchestra/v1/heartbeat.proto",
        "proto/edgeorchestra/v1/model.proto",
    ];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&proto_files, &["proto"])?;

    for file in &proto_files {
        println!("cargo:rerun-if-changed={}", file);
    }
    Ok(())
}
