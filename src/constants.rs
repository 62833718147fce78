pub const SERVER_STRING: &str = concat!("offload/", env!("CARGO_PKG_VERSION"));

pub const BYPASS_HEADER: &str = "X-Mod-Offload-Bypass";

pub const ROBOTS_BODY: &str = "User-agent: *\nDisallow: /";

// Transfer unit for both the caching writer and the client-facing reader.
pub const TRANSFER_CHUNK: usize = 32 * 1024;

// The duplicate-download table is a bounded array; above this many tracked
// downloads the cap degrades to admit-without-tracking.
pub const DUPE_SLOT_COUNT: usize = 512;
