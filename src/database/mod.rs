mod probe;
mod version;

pub use probe::{PostgresProbe, ServerProbe};
pub use version::{parse_major_version, DumpTool, ServerVersion, VersionResolver};
