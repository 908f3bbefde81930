//! End-to-end clock sync scenarios.

mod sync_test;
