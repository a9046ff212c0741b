//! System tests for the `courier` crate live under `tests/`.
//!
//! The suites that talk to a live RabbitMQ broker are `#[ignore]`d; run them
//! with `cargo test -- --ignored` against a broker that already has the test
//! queue (see `COURIER_TEST_QUEUE` in `tests/roundtrip.rs`) declared.
