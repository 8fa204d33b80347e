//! Stamps the mount0 binary with the commit it was built from.

use vergen_gitcl::{Emitter, GitclBuilder};

/// Packagers building from a tarball have no `.git`; they pass the commit in `MOUNT0_GIT_SHA`.
const SHA_OVERRIDE: &str = "MOUNT0_GIT_SHA";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed={SHA_OVERRIDE}");
    match std::env::var(SHA_OVERRIDE) {
        Ok(sha) if !sha.is_empty() => println!("cargo:rustc-env=VERGEN_GIT_SHA={sha}"),
        _ => {
            let git = GitclBuilder::default().sha(true).build()?;
            Emitter::default().add_instructions(&git)?.emit()?;
        }
    }
    Ok(())
}
