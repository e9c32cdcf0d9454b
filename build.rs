use std::env;

fn main() {
    println!("cargo::rustc-check-cfg=cfg(cudnn9)");

    // The version metadata only exists when the cuDNN bindings are part of the build.
    if env::var_os("CARGO_FEATURE_CUDNN").is_none() {
        return;
    }

    let cudnn_version = env::var("DEP_CUDNN_VERSION")
        .expect("Cannot find transitive metadata 'version' from cudnn-sys package.")
        .parse::<u32>()
        .expect("Failed to parse cuDNN version");

    if cudnn_version >= 90000 {
        println!("cargo::rustc-cfg=cudnn9");
    }
}
