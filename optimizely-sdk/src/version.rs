/// Return the SDK version
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
