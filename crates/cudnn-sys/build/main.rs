use std::env;
use std::path;

pub mod cudnn_sdk;

/// The functions recurrent layers call. Everything else in `cudnn.h` stays out of the bindings.
const FUNCTIONS: &[&str] = &[
    "cudnnCreate",
    "cudnnDestroy",
    "cudnnSetStream",
    "cudnnGetVersion",
    "cudnnGetCudartVersion",
    "cudnnCreateDropoutDescriptor",
    "cudnnDestroyDropoutDescriptor",
    "cudnnDropoutGetStatesSize",
    "cudnnSetDropoutDescriptor",
    "cudnnCreateTensorDescriptor",
    "cudnnDestroyTensorDescriptor",
    "cudnnSetTensorNdDescriptor",
    "cudnnCreateFilterDescriptor",
    "cudnnDestroyFilterDescriptor",
    "cudnnSetFilterNdDescriptor",
    "cudnnCreateRNNDescriptor",
    "cudnnDestroyRNNDescriptor",
    "cudnnSetRNNDescriptor_v6",
    "cudnnGetRNNParamsSize",
    "cudnnGetRNNWorkspaceSize",
    "cudnnGetRNNTrainingReserveSize",
    "cudnnRNNForwardTraining",
    "cudnnRNNBackwardData",
    "cudnnRNNBackwardWeights",
];

fn main() {
    let sdk = cudnn_sdk::CudnnSdk::locate().expect("Cannot locate the cuDNN SDK.");
    let cuda_root =
        find_cuda_helper::find_cuda_root().expect("Cannot find the CUDA toolkit, set CUDA_PATH.");

    println!("cargo::rerun-if-changed=build");
    println!("cargo::rerun-if-env-changed=CUDNN_INCLUDE_DIR");
    println!("cargo::metadata=version={}", sdk.version());
    println!("cargo::metadata=version_major={}", sdk.version_major());
    println!(
        "cargo::metadata=include_dir={}",
        sdk.include_dir().display()
    );

    generate_bindings(&sdk, &cuda_root.join("include"));

    find_cuda_helper::include_cuda();
    println!("cargo::rustc-link-lib=dylib=cudnn");
}

fn generate_bindings(sdk: &cudnn_sdk::CudnnSdk, cuda_include: &path::Path) {
    let out_dir = path::PathBuf::from(
        env::var_os("OUT_DIR").expect("OUT_DIR environment variable should be set by cargo."),
    );

    let builder = FUNCTIONS.iter().fold(
        bindgen::Builder::default()
            .header("build/wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk.include_dir().display()))
            .clang_arg(format!("-I{}", cuda_include.display())),
        |builder, function| builder.allowlist_function(function),
    );

    let bindings = builder
        .allowlist_type("^cudnn.*")
        .allowlist_var("^CUDNN_.*")
        .default_enum_style(bindgen::EnumVariation::Rust {
            non_exhaustive: false,
        })
        .derive_default(true)
        .derive_eq(true)
        .derive_hash(true)
        .size_t_is_usize(true)
        .layout_tests(false)
        .generate()
        .expect("Unable to generate cuDNN bindings.");
    bindings
        .write_to_file(out_dir.join("cudnn_sys.rs"))
        .expect("Cannot write cuDNN bindgen output to file.");
}
