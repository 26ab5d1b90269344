//! Consolidated integration tests for lumen-core.
//!
//! Single test binary so proptest-heavy suites and tokio runtimes do
//! not contend across parallel external test files.
//! See: https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod security;
