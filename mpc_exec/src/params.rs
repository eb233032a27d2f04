//! # MPC Executable Parameters
//!
//! This module provides parameters for the MPC executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MpcExecParams {
    /// Network endpoint the simulator bridge connects to
    pub sim_endpoint: String,

    /// Timeout of one receive from the bridge. Bounds how late a finished command can be sent.
    pub recv_timeout_ms: i32,

    /// Delay between a command being computed and it being sent, emulating actuation latency
    pub artificial_delay_ms: u64,
}

impl Default for MpcExecParams {
    fn default() -> Self {
        Self {
            sim_endpoint: "tcp://*:4567".into(),
            recv_timeout_ms: 5,
            artificial_delay_ms: 100,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shipped_params() {
        let params: MpcExecParams =
            util::params::from_str(include_str!("../../params/mpc_exec.toml")).unwrap();

        assert_eq!(params.sim_endpoint, MpcExecParams::default().sim_endpoint);
        assert_eq!(params.artificial_delay_ms, 100);
    }
}
