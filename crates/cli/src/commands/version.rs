use anyhow::Result;

/// Version plus the commit and date stamped by `build.rs`.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    " ",
    env!("BUILD_DATE"),
    ")"
);

/// Execute the version command
pub fn execute() -> Result<()> {
    println!("testloom {LONG_VERSION}");
    Ok(())
}
