//! ---
//! upw_section: "14-versioning"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Build metadata capture for version reporting."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    EmitBuilder::builder().all_build().all_cargo().emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
