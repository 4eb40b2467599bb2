fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Build hosts are not guaranteed to have a system protoc.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::compile_protos("proto/log.proto")?;
    Ok(())
}
