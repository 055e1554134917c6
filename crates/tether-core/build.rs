fn main() {
    // The trap catcher's sigsetjmp shim only exists on unix targets.
    let family = std::env::var("CARGO_CFG_TARGET_FAMILY").unwrap_or_default();
    if family.split(',').any(|f| f == "unix") {
        println!("cargo:rerun-if-changed=src/exceptor/helpers.c");
        cc::Build::new()
            .file("src/exceptor/helpers.c")
            .compile("tether-exceptor-helpers");
    }
}
