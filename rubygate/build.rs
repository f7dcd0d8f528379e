use std::{env, process::Command};

fn rbconfig(ruby: &str, key: &str) -> String {
    let output = Command::new(ruby)
        .args(["-e", &format!("print RbConfig::CONFIG['{key}']")])
        .output()
        .unwrap_or_else(|err| panic!("failed to run {ruby}: {err}"));
    if !output.status.success() {
        panic!("{ruby} could not report RbConfig {key}");
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=RUBY");
    if env::var_os("CARGO_FEATURE_LIBRUBY").is_none() {
        return;
    }

    let ruby = env::var("RUBY").unwrap_or_else(|_| "ruby".to_string());
    let libdir = rbconfig(&ruby, "libdir");
    let so_name = rbconfig(&ruby, "RUBY_SO_NAME");
    println!("cargo:rustc-link-search=native={libdir}");
    println!("cargo:rustc-link-lib=dylib={so_name}");
    if env::var_os("CARGO_CFG_UNIX").is_some() {
        println!("cargo:rustc-link-arg=-Wl,-rpath,{libdir}");
    }
}
