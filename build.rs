fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The generated client is only needed by the `grpc` adapter; plain
    // builds must not require `protoc`.
    if std::env::var_os("CARGO_FEATURE_GRPC").is_none() {
        return Ok(());
    }

    let vendored = "proto/eventfold.proto";
    println!("cargo:rerun-if-changed={vendored}");

    #[cfg(feature = "grpc")]
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&[vendored], &["proto"])?;

    Ok(())
}
