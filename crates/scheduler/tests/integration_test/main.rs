/// Integration tests for the scan scheduler covering end-to-end scans,
/// pool routing and backpressure, tokens, cancellation and shutdown.

mod flow;
mod helpers;
mod lifecycle;
mod submission;
