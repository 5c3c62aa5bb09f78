//! Generated CSI service bindings. See `proto/csi.proto` for the wire definitions; this module
//! just re-exports what `tonic_build` produces so downstream crates have a stable import path.

pub mod csi {
    tonic::include_proto!("csi.v1");
}
