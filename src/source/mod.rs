//! Monitored sources and how they are resolved to playback URLs

pub mod descriptor;
pub mod resolver;

pub use descriptor::{parse_handle_list, SourceDescriptor, SourceKind};
pub use resolver::{CommandResolver, DirectResolver, Liveness, ResolveError, SourceResolver};
