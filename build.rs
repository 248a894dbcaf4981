fn main() {
    // Declare the cfgs derived below as valid
    println!("cargo::rustc-check-cfg=cfg(nightly)");
    println!("cargo::rustc-check-cfg=cfg(freelist_shadow)");

    let version = std::process::Command::new(
        std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string())
    )
    .arg("--version")
    .output()
    .expect("failed to run rustc");

    let version_str = String::from_utf8_lossy(&version.stdout);

    if version_str.contains("nightly") {
        println!("cargo:rustc-cfg=nightly");
    }

    // A ref-count co-located in the previous slot leaves no room for the shadow word.
    let shadow = std::env::var_os("CARGO_FEATURE_FREELIST_SHADOW").is_some();
    let ref_count_in_previous_slot = std::env::var_os("CARGO_FEATURE_REF_COUNT_IN_PREVIOUS_SLOT").is_some();
    if shadow && !ref_count_in_previous_slot {
        println!("cargo:rustc-cfg=freelist_shadow");
    }
}
