/// Build script for Kestrel
///
/// # Shader Compilation Strategy:
/// - DX12: HLSL shaders are compiled at runtime via D3DCompile
/// - Headless: the same files are read and validated at runtime
fn main() {
    // Trigger rebuild if shader files change
    println!("cargo:rerun-if-changed=shaders/particle.vs.hlsl");
    println!("cargo:rerun-if-changed=shaders/particle.ps.hlsl");
}
