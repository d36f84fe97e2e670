fn main() {
    // The procfs backend and the device channel need linux interfaces
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    compile_error!("Building kmemspy for an unsupported platform. Currently only linux and android are supported")
}
