//! Build script for dockfw
//!
//! Handles compile-time configuration for distro packagers and embeds
//! build-time information (git commit, dirty status, build timestamp).

fn main() {
    // Packagers may pin the iptables binary (e.g. /usr/sbin/iptables-legacy)
    println!("cargo:rerun-if-env-changed=DOCKFW_SYSTEM_IPTABLES_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
