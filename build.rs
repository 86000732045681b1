use std::env;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_else(|_| String::from("unknown"));
    if target_os != "windows" {
        return;
    }

    println!("cargo:rerun-if-changed=assets/app/icon.ico");
    let mut res = winres::WindowsResource::new();
    if Path::new("assets/app/icon.ico").exists() {
        res.set_icon("assets/app/icon.ico");
    }

    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".into());
    let product = env::var("OHMYGPU_PRODUCT").unwrap_or_else(|_| "OH MY GPU".into());
    res.set("FileDescription", "GPU model, memory and utilization viewer");
    res.set("ProductName", &product);
    res.set("ProductVersion", &version);
    res.set("FileVersion", &version);
    res.set("OriginalFilename", "ohmygpu.exe");
    res.set("InternalName", "ohmygpu");

    if let Err(e) = res.compile() {
        eprintln!("Failed to embed Windows resources: {e}");
    }
}
