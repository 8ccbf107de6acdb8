pub const MESHD_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}

pub fn long_version() -> String {
    format!("{} ({})", MESHD_VERSION, git_commit_hash())
}
