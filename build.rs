fn main() {
    println!("cargo:rerun-if-changed=src/ffi.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let Ok(crate_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let config = cbindgen::Config::from_file(format!("{}/cbindgen.toml", crate_dir))
        .unwrap_or_default();

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(format!("{}/include/cubic.h", crate_dir));
        }
        Err(e) => println!("cargo:warning=cubic.h not generated: {}", e),
    }
}
