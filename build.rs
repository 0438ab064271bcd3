//! Build script for iptctl
//!
//! Handles compile-time configuration for distro packagers and embeds
//! build-time information (git commit, dirty status, build timestamp).

fn main() {
    // Re-run build if the packager overrides the iptables location
    println!("cargo:rerun-if-env-changed=IPTCTL_SYSTEM_IPTABLES_PATH");

    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
