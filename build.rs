fn main() {
    println!("cargo:rerun-if-changed=proto/meshtastic_core.proto");

    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());

    prost_build::compile_protos(&["proto/meshtastic_core.proto"], &["proto"])
        .expect("failed to compile meshtastic_core.proto");
}
