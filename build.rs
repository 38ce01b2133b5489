//! Compiles the `grpc.lb.v1.LoadBalancer` service used by the LB transport.
fn main() {
    // Server codegen is kept (rather than `.build_server(false)`) so the
    // transport layer's tests can stand up an in-process mock LB service.
    tonic_prost_build::configure()
        .compile_protos(&["proto/grpclb.proto"], &["proto"])
        .unwrap();
}
