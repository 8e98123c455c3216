//! No library surface of its own — this crate exists to host the
//! cross-crate integration tests under `tests/`.
