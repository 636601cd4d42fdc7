/// Native module contains implementations of core traits and the
/// process plumbing they need, talking to the host OS directly:
/// the file system for workspaces and toolchains, process groups and
/// signals for supervision.
pub mod resolver;
pub mod supervisor;
pub mod workspace;
