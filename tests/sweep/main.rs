// Integration tests for the scan / clean / restore pipeline
// Shared fixtures live in common.rs; each area has its own module

mod common;

mod cancel_tests;
mod clean_tests;
mod executor_tests;
mod restore_tests;
mod traversal_tests; // runs against both backends
