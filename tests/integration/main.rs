//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below exercises the control plane end to end against the
//! recording adapters in [`mock_hw`]. All tests run on the host with no
//! real hardware required.

mod api_auth_tests;
mod config_priority_tests;
mod fan_curve_tests;
mod mock_hw;
mod power_cycle_tests;
mod temp_fusion_tests;
