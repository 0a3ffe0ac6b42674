//! Build script for artik-loop-bridge
//!
//! Runs napi-build only when the napi feature is enabled.

fn main() {
    #[cfg(feature = "napi")]
    {
        napi_build::setup();
    }
}
