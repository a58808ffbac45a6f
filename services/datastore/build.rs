//! Build script for compiling the gRPC schema
//!
//! The schema in proto/ is only compiled when the "grpc" feature is enabled.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "grpc")]
    {
        let proto_files = ["proto/datastore.proto"];

        for proto in &proto_files {
            println!("cargo:rerun-if-changed={}", proto);
        }

        tonic_build::configure()
            .build_server(true)
            .build_client(true)
            .compile(&proto_files, &["proto/"])?;
    }

    Ok(())
}
