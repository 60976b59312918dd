//! # Build Script
//!
//! Embeds the Windows Application Manifest (`app.manifest`) through `app.rc`.
//!
//! The manifest runs Hearth `asInvoker`. Machine-scope installs ask for elevation
//! explicitly at runtime (see `elevation.rs`) so that user-scope installs keep working
//! for standard users.

fn main() {
    println!("cargo:rerun-if-changed=app.rc");
    println!("cargo:rerun-if-changed=app.manifest");
    // A missing resource compiler only loses the manifest, the binary still works.
    let _ = embed_resource::compile("app.rc", embed_resource::NONE);
}
