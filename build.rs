use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const OUT_DIR: &str = "./generated/";

// Written to `generated/` so `lib.rs` can include it by path.
fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=protos/raft.proto");

    fs::create_dir_all(OUT_DIR)?;
    tonic_build::configure()
        .out_dir(OUT_DIR)
        .compile(&["./protos/raft.proto"], &[PROTO_DIR])
}
