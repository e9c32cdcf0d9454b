//! Raw bindings to the subset of cuDNN used by recurrent layers: the library context, dropout,
//! tensor and filter descriptors and the per-step RNN API.
#![allow(non_upper_case_globals, non_camel_case_types, non_snake_case, dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/cudnn_sys.rs"));
