//! Compiles `proto/cast_channel.proto` into Rust types with `prost`.
//!
//! Uses the vendored `protoc` binary so the build doesn't depend on a
//! system-installed protobuf compiler.

fn main() {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary");
        std::env::set_var("PROTOC", protoc);
    }

    prost_build::Config::new()
        .compile_protos(&["proto/cast_channel.proto"], &["proto"])
        .expect("failed to compile cast_channel.proto");

    println!("cargo:rerun-if-changed=proto/cast_channel.proto");
}
