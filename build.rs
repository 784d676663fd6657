//! Build script for vr_warp
//! Rebuilds when the embedded WGSL changes

fn main() {
    // include_str! already tracks the file, but say it explicitly for the shader dir
    println!("cargo:rerun-if-changed=src/shaders");
}
