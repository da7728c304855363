// 构建脚本: 链接FFmpeg静态库依赖
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // 静态 FFmpeg 需要显式链接 pthread
    #[cfg(target_os = "linux")]
    {
        println!("cargo:rustc-link-lib=dylib=pthread");
    }
}
